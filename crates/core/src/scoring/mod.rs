//! Applicant scoring.
//!
//! Pure functions ranking competing applicants for a course seat. The
//! composite is a weighted sum of five factor scores, each in [0, 1], and is
//! rounded to 6 decimals so that orderings derived from it are reproducible
//! across runs and platforms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScoreWeights;
use crate::domain::models::{Course, Student};

/// Per-factor breakdown of one applicant's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub gpa: f64,
    pub interest: f64,
    pub time: f64,
    pub year: f64,
    pub prereq: f64,
}

/// Factor breakdown plus the rounded composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub factors: FactorScores,
    pub composite: f64,
}

/// GPA normalized against the 4.0 scale.
pub fn gpa_score(gpa: f64) -> f64 {
    (gpa / 4.0).clamp(0.0, 1.0)
}

/// Jaccard similarity between the student's interests and the course tags.
/// An empty union scores 0.
pub fn interest_score(student: &Student, course: &Course) -> f64 {
    let intersection = student.interests.intersection(&course.tags).count();
    let union = student.interests.union(&course.tags).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Exponential decay on hours elapsed between booking open and application.
/// Applications before the window opened (or to a never-opened course) score 1.
pub fn time_score(
    applied_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    lambda: f64,
) -> f64 {
    let opened_at = match opened_at {
        Some(t) => t,
        None => return 1.0,
    };
    let elapsed_ms = (applied_at - opened_at).num_milliseconds().max(0);
    let hours = elapsed_ms as f64 / (3600.0 * 1000.0);
    (-lambda * hours).exp()
}

/// 1.0 inside the preferred-year cohort, otherwise linear falloff with the
/// distance to the nearest preferred year. A course with no preferred years
/// accepts every cohort equally.
pub fn year_score(student_year: u8, course: &Course) -> f64 {
    if course.preferred_years.is_empty() || course.preferred_years.contains(&student_year) {
        return 1.0;
    }
    let min_distance = course
        .preferred_years
        .iter()
        .map(|y| (*y as i32 - student_year as i32).abs())
        .min()
        .unwrap_or(0);
    (1.0 - min_distance as f64 / 4.0).max(0.0)
}

/// Fraction of the course prerequisites the student has completed.
/// No prerequisites means a full score.
pub fn prereq_score(student: &Student, course: &Course) -> f64 {
    if course.prerequisites.is_empty() {
        return 1.0;
    }
    let completed = course
        .prerequisites
        .iter()
        .filter(|p| student.completed_courses.contains(*p))
        .count();
    completed as f64 / course.prerequisites.len() as f64
}

/// Round to 6 decimals; the rounded composite is the only floating-point
/// value exposed outside this module.
fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Fixed-point form of a rounded composite, used as an ordering key.
pub fn composite_micros(composite: f64) -> i64 {
    (composite * 1e6).round() as i64
}

/// Scores one (student, course) application.
pub fn score(
    student: &Student,
    course: &Course,
    applied_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    weights: &ScoreWeights,
    lambda: f64,
) -> ScoreBreakdown {
    let factors = FactorScores {
        gpa: gpa_score(student.gpa),
        interest: interest_score(student, course),
        time: time_score(applied_at, opened_at, lambda),
        year: year_score(student.year, course),
        prereq: prereq_score(student, course),
    };

    let composite = weights.gpa * factors.gpa
        + weights.interest * factors.interest
        + weights.time * factors.time
        + weights.year * factors.year
        + weights.prereq * factors.prereq;

    ScoreBreakdown {
        factors,
        composite: round6(composite),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIME_DECAY_LAMBDA;
    use crate::testing::fixtures;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn gpa_score_is_clamped() {
        assert_eq!(gpa_score(2.0), 0.5);
        assert_eq!(gpa_score(4.0), 1.0);
        assert_eq!(gpa_score(4.5), 1.0);
        assert_eq!(gpa_score(-1.0), 0.0);
    }

    #[test]
    fn interest_score_is_jaccard() {
        let mut student = fixtures::student("s1", 3.5, 2);
        let mut course = fixtures::course("c1", "CS101");

        student.interests = ["ai", "systems"].iter().map(|s| s.to_string()).collect();
        course.tags = ["ai", "theory"].iter().map(|s| s.to_string()).collect();
        // intersection {ai}, union {ai, systems, theory}
        let score = interest_score(&student, &course);
        assert!((score - 1.0 / 3.0).abs() < 1e-12);

        student.interests.clear();
        course.tags.clear();
        assert_eq!(interest_score(&student, &course), 0.0);
    }

    #[test]
    fn time_score_halves_at_24_hours() {
        let opened = Utc::now();
        let applied = opened + Duration::hours(24);
        let score = time_score(applied, Some(opened), DEFAULT_TIME_DECAY_LAMBDA);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn time_score_before_open_is_full() {
        let opened = Utc::now();
        let applied = opened - Duration::hours(2);
        assert_eq!(
            time_score(applied, Some(opened), DEFAULT_TIME_DECAY_LAMBDA),
            1.0
        );
        assert_eq!(time_score(applied, None, DEFAULT_TIME_DECAY_LAMBDA), 1.0);
    }

    #[test]
    fn year_score_falls_off_with_distance() {
        let mut course = fixtures::course("c1", "CS101");
        course.preferred_years = [2u8].into_iter().collect();

        assert_eq!(year_score(2, &course), 1.0);
        assert_eq!(year_score(3, &course), 0.75);
        assert_eq!(year_score(4, &course), 0.5);
        // distance > 4 bottoms out at zero
        course.preferred_years = [1u8].into_iter().collect();
        assert_eq!(year_score(6, &course), 0.0);

        course.preferred_years.clear();
        assert_eq!(year_score(4, &course), 1.0);
    }

    #[test]
    fn prereq_score_counts_completed() {
        let mut student = fixtures::student("s1", 3.5, 2);
        let mut course = fixtures::course("c1", "CS301");
        course.prerequisites = vec!["cs101".to_string(), "cs201".to_string()];

        assert_eq!(prereq_score(&student, &course), 0.0);

        student.completed_courses.insert("cs101".to_string());
        assert_eq!(prereq_score(&student, &course), 0.5);

        student.completed_courses.insert("cs201".to_string());
        assert_eq!(prereq_score(&student, &course), 1.0);

        course.prerequisites.clear();
        assert_eq!(prereq_score(&student, &course), 1.0);
    }

    #[test]
    fn composite_is_deterministic() {
        let student = fixtures::student("s1", 3.9, 2);
        let course = fixtures::course("c1", "CS101");
        let weights = ScoreWeights::default();
        let opened = Utc::now();
        let applied = opened + Duration::minutes(30);

        let a = score(
            &student,
            &course,
            applied,
            Some(opened),
            &weights,
            DEFAULT_TIME_DECAY_LAMBDA,
        );
        let b = score(
            &student,
            &course,
            applied,
            Some(opened),
            &weights,
            DEFAULT_TIME_DECAY_LAMBDA,
        );
        assert_eq!(a, b);
        assert_eq!(composite_micros(a.composite), composite_micros(b.composite));
    }

    proptest! {
        #[test]
        fn composite_stays_within_unit_interval(
            gpa in 0.0f64..=4.0,
            year in 1u8..=6,
            hours in 0i64..=2000,
        ) {
            let mut student = fixtures::student("s1", gpa, year);
            student.interests = ["ai", "systems"].iter().map(|s| s.to_string()).collect();
            let course = fixtures::course("c1", "CS101");
            let opened = Utc::now();
            let applied = opened + Duration::hours(hours);

            let breakdown = score(
                &student,
                &course,
                applied,
                Some(opened),
                &ScoreWeights::default(),
                DEFAULT_TIME_DECAY_LAMBDA,
            );

            prop_assert!(breakdown.composite >= 0.0);
            prop_assert!(breakdown.composite <= 1.0);
            for factor in [
                breakdown.factors.gpa,
                breakdown.factors.interest,
                breakdown.factors.time,
                breakdown.factors.year,
                breakdown.factors.prereq,
            ] {
                prop_assert!((0.0..=1.0).contains(&factor));
            }
        }
    }
}
