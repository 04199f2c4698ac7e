//! Server configuration from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

use enroll_core::{AllocationStrategy, EngineConfig, ScoreWeights};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Process-level configuration. Engine options are validated again by
/// `RegistrationService::new`; a bad value is fatal at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: String,
    /// SQLite database path
    pub database_path: String,
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = EngineConfig::default();
        let default_weights = ScoreWeights::default();

        let engine = EngineConfig {
            score_weights: ScoreWeights {
                gpa: env_f64("GPA_WEIGHT", default_weights.gpa)?,
                interest: env_f64("INTEREST_WEIGHT", default_weights.interest)?,
                time: env_f64("TIME_WEIGHT", default_weights.time)?,
                year: env_f64("YEAR_WEIGHT", default_weights.year)?,
                prereq: env_f64("PREREQ_WEIGHT", default_weights.prereq)?,
            },
            time_decay_lambda: env_f64("TIME_DECAY_LAMBDA", defaults.time_decay_lambda)?,
            allocation_strategy: env_strategy(
                "ALLOCATION_STRATEGY",
                defaults.allocation_strategy,
            )?,
            default_rows: env_u32("DEFAULT_ROWS", defaults.default_rows)?,
            default_seats_per_row: env_u32(
                "DEFAULT_SEATS_PER_ROW",
                defaults.default_seats_per_row,
            )?,
            request_timeout: Duration::from_millis(env_u64(
                "REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
        };

        Ok(Self {
            bind_address: env_var_or("BIND_ADDRESS", "127.0.0.1:3000"),
            database_path: env_var_or("DATABASE_PATH", "data/registration.db"),
            engine,
        })
    }
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_strategy(
    name: &str,
    default: AllocationStrategy,
) -> Result<AllocationStrategy, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}
