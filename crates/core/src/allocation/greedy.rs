//! Greedy strategies.

use std::collections::HashSet;

use super::{AllocationInput, AllocationOutcome, SeatAward};

/// Each course independently takes its top applicants by score. Students on
/// several waitlists may be awarded several seats; the commit-time cascade
/// resolves those in preference order.
pub(crate) fn independent(input: &AllocationInput) -> AllocationOutcome {
    let mut outcome = AllocationOutcome::default();
    for course in &input.courses {
        for entry in course.entries.iter().take(course.free_seats as usize) {
            outcome.awards.push(SeatAward {
                course_id: course.course_id.clone(),
                student_id: entry.student_id.clone(),
            });
        }
    }
    outcome
}

/// One pass in course-id order; a student already granted a seat earlier in
/// the pass is skipped by later courses.
pub(crate) fn single_pass(input: &AllocationInput) -> AllocationOutcome {
    let mut outcome = AllocationOutcome::default();
    let mut assigned: HashSet<&str> = HashSet::new();
    for course in &input.courses {
        let mut granted = 0u32;
        for entry in &course.entries {
            if granted >= course.free_seats {
                break;
            }
            if assigned.contains(entry.student_id.as_str()) {
                continue;
            }
            assigned.insert(entry.student_id.as_str());
            granted += 1;
            outcome.awards.push(SeatAward {
                course_id: course.course_id.clone(),
                student_id: entry.student_id.clone(),
            });
        }
    }
    outcome
}
