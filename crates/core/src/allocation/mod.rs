//! Batch seat allocation.
//!
//! Pure matchers over immutable snapshots: they never touch live state, so
//! the registration service can run them outside any I/O and commit the
//! result under the course locks. All strategies are deterministic given a
//! snapshot; `balanced` and `student_optimal` additionally produce stable
//! matchings (no student/course pair prefers each other to the result).
//!
//! Courses rank students by waitlist order (composite score with its
//! tie-breakers); students rank courses by their preference priority, with
//! unlisted courses after listed ones and course id as the final tie-break.

mod deferred;
mod greedy;


use std::collections::HashMap;

use crate::config::AllocationStrategy;
use crate::domain::{CoursePreference, WaitlistEntry};

/// One course's view at allocation time.
#[derive(Debug, Clone)]
pub struct CourseSnapshot {
    pub course_id: String,
    /// Seats still unoccupied when the snapshot was taken; allocation never
    /// awards more than this.
    pub free_seats: u32,
    /// WAITING entries in canonical waitlist order.
    pub entries: Vec<WaitlistEntry>,
}

/// Matcher input: course snapshots plus the preference lists of every
/// student appearing in them.
#[derive(Debug, Clone, Default)]
pub struct AllocationInput {
    /// Sorted by course id.
    pub courses: Vec<CourseSnapshot>,
    /// student id -> preferences sorted by priority ascending.
    pub preferences: HashMap<String, Vec<CoursePreference>>,
}

/// A single seat grant. The concrete seat label is chosen at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatAward {
    pub course_id: String,
    pub student_id: String,
}

/// Deterministically ordered award list.
#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub awards: Vec<SeatAward>,
}

/// A student's ranking of a course: listed preferences first (by priority),
/// unlisted courses after, course id as the final tie-break. Lower is
/// preferred.
pub(crate) fn course_rank(
    input: &AllocationInput,
    student_id: &str,
    course_id: &str,
) -> (u8, u32, String) {
    let listed = input
        .preferences
        .get(student_id)
        .and_then(|prefs| prefs.iter().find(|p| p.course_id == course_id));
    match listed {
        Some(pref) => (0, pref.priority, course_id.to_string()),
        None => (1, 0, course_id.to_string()),
    }
}

/// True when the student ranks course `a` strictly above course `b`.
pub(crate) fn prefers(input: &AllocationInput, student_id: &str, a: &str, b: &str) -> bool {
    course_rank(input, student_id, a) < course_rank(input, student_id, b)
}

/// Runs the selected strategy over the snapshot.
pub fn run(strategy: AllocationStrategy, input: &AllocationInput) -> AllocationOutcome {
    let mut outcome = match strategy {
        AllocationStrategy::Greedy => greedy::independent(input),
        AllocationStrategy::CourseOptimal => greedy::single_pass(input),
        AllocationStrategy::Balanced => deferred::course_proposing(input),
        AllocationStrategy::StudentOptimal => deferred::student_proposing(input),
    };
    sort_awards(input, &mut outcome);
    outcome
}

/// Canonical award order: course id, then the student's rank on that
/// course's waitlist. Keeps commits and event emission reproducible.
fn sort_awards(input: &AllocationInput, outcome: &mut AllocationOutcome) {
    let ranks: HashMap<(&str, &str), usize> = input
        .courses
        .iter()
        .flat_map(|course| {
            course.entries.iter().enumerate().map(move |(idx, entry)| {
                ((course.course_id.as_str(), entry.student_id.as_str()), idx)
            })
        })
        .collect();
    outcome.awards.sort_by_key(|award| {
        let rank = ranks
            .get(&(award.course_id.as_str(), award.student_id.as_str()))
            .copied()
            .unwrap_or(usize::MAX);
        (award.course_id.clone(), rank)
    });
}
