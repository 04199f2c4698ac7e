//! Per-course waitlists.
//!
//! Each course keeps its applicants in a total order so that rankings are
//! reproducible: composite score descending, then application time ascending,
//! then student id ascending. The order is realized through [`WaitlistKey`],
//! whose derived `Ord` encodes exactly those tie-breakers.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::domain::{RegistrationError, Result, WaitlistEntry};
use crate::scoring::composite_micros;

/// Sort key for one waitlist entry. Ascending `Ord` on this key gives the
/// canonical waitlist order (score DESC via negation, time ASC, id ASC).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WaitlistKey {
    neg_score_micros: i64,
    applied_at_ms: i64,
    student_id: String,
}

impl WaitlistKey {
    pub fn for_entry(entry: &WaitlistEntry) -> Self {
        Self {
            neg_score_micros: -composite_micros(entry.composite_score),
            applied_at_ms: entry.applied_at.timestamp_millis(),
            student_id: entry.student_id.clone(),
        }
    }
}

#[derive(Default)]
struct CourseWaitlist {
    /// Entries sorted ascending by their [`WaitlistKey`].
    ordered: Vec<WaitlistEntry>,
    /// student id -> key, for O(log n) rank and removal
    keys: HashMap<String, WaitlistKey>,
}

impl CourseWaitlist {
    fn position_of(&self, key: &WaitlistKey) -> std::result::Result<usize, usize> {
        self.ordered
            .binary_search_by(|entry| WaitlistKey::for_entry(entry).cmp(key))
    }
}

/// Thread-safe store of per-course ordered waitlists. Mutations are expected
/// to happen under the owning course's lock; the map itself only guards
/// against torn reads across courses.
#[derive(Default)]
pub struct WaitlistStore {
    courses: DashMap<String, CourseWaitlist>,
}

impl WaitlistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry and returns its 1-based position. A student already
    /// present in a non-terminal entry is rejected.
    pub fn insert(&self, entry: WaitlistEntry) -> Result<usize> {
        let mut course = self.courses.entry(entry.course_id.clone()).or_default();
        if course.keys.contains_key(&entry.student_id) {
            return Err(RegistrationError::AlreadyWaitlisted {
                student_id: entry.student_id.clone(),
                course_id: entry.course_id.clone(),
            });
        }
        let key = WaitlistKey::for_entry(&entry);
        let position = match course.position_of(&key) {
            Ok(found) => found,
            Err(insert_at) => insert_at,
        };
        course.keys.insert(entry.student_id.clone(), key);
        course.ordered.insert(position, entry);
        Ok(position + 1)
    }

    /// Removes a student's entry. Idempotent; returns whether anything was
    /// removed.
    pub fn remove(&self, course_id: &str, student_id: &str) -> bool {
        let mut course = match self.courses.get_mut(course_id) {
            Some(c) => c,
            None => return false,
        };
        let key = match course.keys.remove(student_id) {
            Some(k) => k,
            None => return false,
        };
        if let Ok(position) = course.position_of(&key) {
            course.ordered.remove(position);
            true
        } else {
            false
        }
    }

    pub fn top_k(&self, course_id: &str, k: usize) -> Vec<WaitlistEntry> {
        self.courses
            .get(course_id)
            .map(|c| c.ordered.iter().take(k).cloned().collect())
            .unwrap_or_default()
    }

    /// 1-based rank of a student, or None when not present.
    pub fn rank_of(&self, course_id: &str, student_id: &str) -> Option<usize> {
        let course = self.courses.get(course_id)?;
        let key = course.keys.get(student_id)?;
        course.position_of(key).ok().map(|p| p + 1)
    }

    /// Removes and returns the highest-ranked entry.
    pub fn pop_top(&self, course_id: &str) -> Option<WaitlistEntry> {
        let mut course = self.courses.get_mut(course_id)?;
        if course.ordered.is_empty() {
            return None;
        }
        let entry = course.ordered.remove(0);
        course.keys.remove(&entry.student_id);
        Some(entry)
    }

    pub fn len(&self, course_id: &str) -> usize {
        self.courses
            .get(course_id)
            .map(|c| c.ordered.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, course_id: &str) -> bool {
        self.len(course_id) == 0
    }

    /// Full ordered copy, for batch allocation.
    pub fn snapshot(&self, course_id: &str) -> Vec<WaitlistEntry> {
        self.courses
            .get(course_id)
            .map(|c| c.ordered.clone())
            .unwrap_or_default()
    }

    /// Removes and returns every entry for a course (booking-close expiry).
    pub fn drain(&self, course_id: &str) -> Vec<WaitlistEntry> {
        let mut course = match self.courses.get_mut(course_id) {
            Some(c) => c,
            None => return Vec::new(),
        };
        course.keys.clear();
        std::mem::take(&mut course.ordered)
    }

    /// Courses on which the given student currently waits. Used to widen the
    /// lock set before an allocation cascade.
    pub fn courses_for_student(&self, student_id: &str) -> Vec<String> {
        let mut courses: Vec<String> = self
            .courses
            .iter()
            .filter(|entry| entry.value().keys.contains_key(student_id))
            .map(|entry| entry.key().clone())
            .collect();
        courses.sort_unstable();
        courses
    }
}
