//! Deferred-acceptance strategies.
//!
//! Both sides terminate because a course proposes to each applicant at most
//! once and a student proposes to each course at most once.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::{course_rank, prefers, AllocationInput, AllocationOutcome, SeatAward};

/// Course-proposing deferred acceptance (the `balanced` default).
///
/// Rounds: every course with open slots offers them to its next-best
/// applicants; a student holds only the offer from their most-preferred
/// course and releases the rest, which reopen in later rounds. Ends when no
/// course can make a further proposal.
pub(crate) fn course_proposing(input: &AllocationInput) -> AllocationOutcome {
    // Next waitlist index each course will propose to.
    let mut cursor: HashMap<&str, usize> = HashMap::new();
    // Offers currently held, per course.
    let mut held_count: HashMap<&str, u32> = HashMap::new();
    // student -> course whose offer they currently hold.
    let mut holding: HashMap<&str, &str> = HashMap::new();

    loop {
        let mut proposed = false;
        for course in &input.courses {
            let course_id = course.course_id.as_str();
            loop {
                let held = held_count.get(course_id).copied().unwrap_or(0);
                if held >= course.free_seats {
                    break;
                }
                let next = cursor.entry(course_id).or_insert(0);
                let entry = match course.entries.get(*next) {
                    Some(e) => e,
                    None => break,
                };
                *next += 1;
                proposed = true;

                let student_id = entry.student_id.as_str();
                match holding.get(student_id).copied() {
                    None => {
                        holding.insert(student_id, course_id);
                        *held_count.entry(course_id).or_insert(0) += 1;
                    }
                    Some(current) => {
                        if prefers(input, student_id, course_id, current) {
                            // Switch: the released slot reopens at `current`.
                            if let Some(count) = held_count.get_mut(current) {
                                *count -= 1;
                            }
                            holding.insert(student_id, course_id);
                            *held_count.entry(course_id).or_insert(0) += 1;
                        }
                        // Otherwise the offer is declined and the slot stays
                        // open for this course's next applicant.
                    }
                }
            }
        }
        if !proposed {
            break;
        }
    }

    let awards = holding
        .into_iter()
        .map(|(student_id, course_id)| SeatAward {
            course_id: course_id.to_string(),
            student_id: student_id.to_string(),
        })
        .collect();
    AllocationOutcome { awards }
}

/// Student-proposing deferred acceptance.
///
/// Each unmatched student proposes down their preference ranking, restricted
/// to courses whose waitlist they are on. A course tentatively holds its top
/// capacity-many proposals by waitlist rank; displaced students cascade.
pub(crate) fn student_proposing(input: &AllocationInput) -> AllocationOutcome {
    // Per-course: student -> waitlist rank.
    let mut rank_in_course: HashMap<&str, HashMap<&str, usize>> = HashMap::new();
    for course in &input.courses {
        let ranks = rank_in_course.entry(course.course_id.as_str()).or_default();
        for (idx, entry) in course.entries.iter().enumerate() {
            ranks.insert(entry.student_id.as_str(), idx);
        }
    }

    // Per-student: courses they can propose to, most preferred first.
    let mut proposal_lists: HashMap<&str, Vec<&str>> = HashMap::new();
    for course in &input.courses {
        for entry in &course.entries {
            proposal_lists
                .entry(entry.student_id.as_str())
                .or_default()
                .push(course.course_id.as_str());
        }
    }
    for (student_id, courses) in proposal_lists.iter_mut() {
        courses.sort_by_key(|course_id| course_rank(input, student_id, course_id));
    }

    let mut queue: VecDeque<&str> = {
        let mut students: Vec<&str> = proposal_lists.keys().copied().collect();
        students.sort_unstable();
        students.into()
    };
    let mut next_proposal: HashMap<&str, usize> = HashMap::new();
    // Per-course held proposals, keyed by waitlist rank (lower is better).
    let mut held: HashMap<&str, BTreeMap<usize, &str>> = HashMap::new();

    while let Some(student_id) = queue.pop_front() {
        let list = &proposal_lists[student_id];
        let cursor = next_proposal.entry(student_id).or_insert(0);
        let course_id = match list.get(*cursor) {
            Some(c) => *c,
            None => continue, // exhausted every option
        };
        *cursor += 1;

        let capacity = input
            .courses
            .iter()
            .find(|c| c.course_id == course_id)
            .map(|c| c.free_seats as usize)
            .unwrap_or(0);
        if capacity == 0 {
            queue.push_back(student_id);
            continue;
        }

        let rank = rank_in_course[course_id][student_id];
        let holds = held.entry(course_id).or_default();
        holds.insert(rank, student_id);
        if holds.len() > capacity {
            // Displace the worst-ranked held proposal.
            if let Some((&worst_rank, _)) = holds.iter().next_back() {
                if let Some(displaced) = holds.remove(&worst_rank) {
                    queue.push_back(displaced);
                }
            }
        }
    }

    let awards = held
        .into_iter()
        .flat_map(|(course_id, holds)| {
            holds.into_values().map(move |student_id| SeatAward {
                course_id: course_id.to_string(),
                student_id: student_id.to_string(),
            })
        })
        .collect();
    AllocationOutcome { awards }
}
