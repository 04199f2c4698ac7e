use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{RegistrationError, Result};

/// Half-life of 24 hours: exp(-lambda * 24) == 0.5.
pub const DEFAULT_TIME_DECAY_LAMBDA: f64 = 0.028881132523331052;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Per-factor weights for the composite applicant score.
/// The five weights must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub gpa: f64,
    pub interest: f64,
    pub time: f64,
    pub year: f64,
    pub prereq: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            gpa: 0.35,
            interest: 0.30,
            time: 0.20,
            year: 0.10,
            prereq: 0.05,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.gpa + self.interest + self.time + self.year + self.prereq
    }

    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("gpaWeight", self.gpa),
            ("interestWeight", self.interest),
            ("timeWeight", self.time),
            ("yearWeight", self.year),
            ("prereqWeight", self.prereq),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(RegistrationError::ConfigurationInvalid(format!(
                    "{name} must be within [0, 1], got {w}"
                )));
            }
        }
        if (self.sum() - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "score weights must sum to 1.0, got {}",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// Batch matcher selection. Wire form is kebab-case ("student-optimal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationStrategy {
    Balanced,
    StudentOptimal,
    CourseOptimal,
    Greedy,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::Balanced => "balanced",
            AllocationStrategy::StudentOptimal => "student-optimal",
            AllocationStrategy::CourseOptimal => "course-optimal",
            AllocationStrategy::Greedy => "greedy",
        }
    }
}

impl std::str::FromStr for AllocationStrategy {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "balanced" => Ok(AllocationStrategy::Balanced),
            "student-optimal" => Ok(AllocationStrategy::StudentOptimal),
            "course-optimal" => Ok(AllocationStrategy::CourseOptimal),
            "greedy" => Ok(AllocationStrategy::Greedy),
            _ => Err(RegistrationError::ConfigurationInvalid(format!(
                "unknown allocation strategy: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Engine-wide tunables. Validated once at startup; invalid values are fatal.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub score_weights: ScoreWeights,
    pub time_decay_lambda: f64,
    pub allocation_strategy: AllocationStrategy,
    pub default_rows: u32,
    pub default_seats_per_row: u32,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score_weights: ScoreWeights::default(),
            time_decay_lambda: DEFAULT_TIME_DECAY_LAMBDA,
            allocation_strategy: AllocationStrategy::Balanced,
            default_rows: 6,
            default_seats_per_row: 5,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.score_weights.validate()?;
        if self.time_decay_lambda <= 0.0 {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "timeDecayLambda must be positive, got {}",
                self.time_decay_lambda
            )));
        }
        if self.default_rows == 0 || self.default_rows > 26 {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "defaultRows must be within 1..=26, got {}",
                self.default_rows
            )));
        }
        if self.default_seats_per_row == 0 {
            return Err(RegistrationError::ConfigurationInvalid(
                "defaultSeatsPerRow must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RegistrationError::ConfigurationInvalid(
                "requestTimeoutMs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_are_valid() {
        assert!(ScoreWeights::default().validate().is_ok());
    }

    #[test]
    fn weights_off_by_more_than_tolerance_rejected() {
        let weights = ScoreWeights {
            gpa: 0.35,
            interest: 0.30,
            time: 0.20,
            year: 0.10,
            prereq: 0.06,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn weights_within_tolerance_accepted() {
        let weights = ScoreWeights {
            gpa: 0.35,
            interest: 0.30,
            time: 0.20,
            year: 0.10,
            prereq: 0.05 + 5e-7,
        };
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn strategy_round_trips_through_str() {
        for strategy in [
            AllocationStrategy::Balanced,
            AllocationStrategy::StudentOptimal,
            AllocationStrategy::CourseOptimal,
            AllocationStrategy::Greedy,
        ] {
            let parsed: AllocationStrategy = strategy.as_str().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert!("round-robin".parse::<AllocationStrategy>().is_err());
    }

    #[test]
    fn default_lambda_halves_at_24_hours() {
        let decayed = (-DEFAULT_TIME_DECAY_LAMBDA * 24.0).exp();
        assert!((decayed - 0.5).abs() < 1e-9);
    }

    #[test]
    fn engine_config_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
