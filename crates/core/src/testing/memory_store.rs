//! In-memory [`RegistrationStore`] used by service tests.
//!
//! Behaves like the SQLite store: transactions are atomic, the seat-config
//! version is bump-and-checked, and the data-model uniqueness constraints
//! are enforced and reported as `Conflict`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::domain::{
    Course, CoursePreference, RegistrationEvent, SeatBooking, SeatConfig, Student, WaitlistEntry,
    WaitlistStatus,
};
use crate::ports::registration_store::StoreResult;
use crate::ports::{CourseTxn, RegistrationStore, StoreError, TxnOp};

#[derive(Default, Clone)]
struct Inner {
    students: HashMap<String, Student>,
    courses: HashMap<String, Course>,
    seat_configs: HashMap<String, SeatConfig>,
    bookings: Vec<SeatBooking>,
    waitlist: Vec<WaitlistEntry>,
    preferences: HashMap<String, Vec<CoursePreference>>,
    events: Vec<RegistrationEvent>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    /// Number of upcoming commits to fail with `Conflict`, for retry tests.
    forced_conflicts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the next `n` commits to fail with a version conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Audit log snapshot, in append order.
    pub fn event_log(&self) -> Vec<RegistrationEvent> {
        self.inner.lock().expect("store lock").events.clone()
    }

    /// All bookings ever made (active and inactive).
    pub fn bookings(&self) -> Vec<SeatBooking> {
        self.inner.lock().expect("store lock").bookings.clone()
    }

    /// All waitlist entries, any status.
    pub fn waitlist_rows(&self) -> Vec<WaitlistEntry> {
        self.inner.lock().expect("store lock").waitlist.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock")
    }
}

fn apply_op(inner: &mut Inner, course_id: &str, op: TxnOp) -> StoreResult<()> {
    match op {
        TxnOp::InsertBooking(booking) => {
            let duplicate_seat = inner.bookings.iter().any(|b| {
                b.active && b.course_id == course_id && b.seat_label == booking.seat_label
            });
            if duplicate_seat {
                return Err(StoreError::Conflict(format!(
                    "seat {} already actively booked",
                    booking.seat_label
                )));
            }
            let duplicate_student = inner.bookings.iter().any(|b| {
                b.active && b.course_id == course_id && b.student_id == booking.student_id
            });
            if duplicate_student {
                return Err(StoreError::Conflict(format!(
                    "student {} already actively booked",
                    booking.student_id
                )));
            }
            inner.bookings.push(booking);
        }
        TxnOp::DeactivateBooking { student_id } => {
            for booking in inner.bookings.iter_mut() {
                if booking.active && booking.course_id == course_id && booking.student_id == student_id
                {
                    booking.active = false;
                }
            }
        }
        TxnOp::InsertWaitlistEntry(entry) => {
            let duplicate = inner.waitlist.iter().any(|e| {
                !e.status.is_terminal()
                    && e.course_id == course_id
                    && e.student_id == entry.student_id
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "student {} already waitlisted",
                    entry.student_id
                )));
            }
            inner.waitlist.push(entry);
        }
        TxnOp::SetWaitlistStatus { student_id, status } => {
            for entry in inner.waitlist.iter_mut() {
                if !entry.status.is_terminal()
                    && entry.course_id == course_id
                    && entry.student_id == student_id
                {
                    entry.status = status;
                }
            }
        }
        TxnOp::SetBookingStatus { status, opened_at } => {
            let config = inner
                .seat_configs
                .get_mut(course_id)
                .ok_or_else(|| StoreError::NotFound(format!("seat config: {course_id}")))?;
            config.booking_status = status;
            config.booking_opens_at = opened_at;
        }
        TxnOp::AppendEvent(record) => {
            inner.events.push(record);
        }
    }
    Ok(())
}

#[async_trait]
impl RegistrationStore for InMemoryStore {
    async fn get_student(&self, student_id: &str) -> StoreResult<Option<Student>> {
        Ok(self.lock().students.get(student_id).cloned())
    }

    async fn get_course(&self, id_or_code: &str) -> StoreResult<Option<Course>> {
        let inner = self.lock();
        Ok(inner
            .courses
            .get(id_or_code)
            .cloned()
            .or_else(|| inner.courses.values().find(|c| c.code == id_or_code).cloned()))
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        let mut courses: Vec<Course> = self.lock().courses.values().cloned().collect();
        courses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(courses)
    }

    async fn get_seat_config(&self, course_id: &str) -> StoreResult<Option<SeatConfig>> {
        Ok(self.lock().seat_configs.get(course_id).cloned())
    }

    async fn active_bookings(&self, course_id: &str) -> StoreResult<Vec<SeatBooking>> {
        Ok(self
            .lock()
            .bookings
            .iter()
            .filter(|b| b.active && b.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn active_booking_for(
        &self,
        course_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<SeatBooking>> {
        Ok(self
            .lock()
            .bookings
            .iter()
            .find(|b| b.active && b.course_id == course_id && b.student_id == student_id)
            .cloned())
    }

    async fn waiting_entries(&self, course_id: &str) -> StoreResult<Vec<WaitlistEntry>> {
        Ok(self
            .lock()
            .waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting && e.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn active_bookings_for_student(
        &self,
        student_id: &str,
    ) -> StoreResult<Vec<SeatBooking>> {
        Ok(self
            .lock()
            .bookings
            .iter()
            .filter(|b| b.active && b.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn preferences_for(&self, student_id: &str) -> StoreResult<Vec<CoursePreference>> {
        Ok(self
            .lock()
            .preferences
            .get(student_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_preferences(
        &self,
        student_id: &str,
        prefs: &[CoursePreference],
    ) -> StoreResult<()> {
        self.lock()
            .preferences
            .insert(student_id.to_string(), prefs.to_vec());
        Ok(())
    }

    async fn commit(&self, txn: CourseTxn) -> StoreResult<()> {
        if self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict("injected conflict".to_string()));
        }

        let mut inner = self.lock();
        let current_version = inner
            .seat_configs
            .get(&txn.course_id)
            .map(|c| c.version)
            .ok_or_else(|| StoreError::NotFound(format!("seat config: {}", txn.course_id)))?;
        if current_version != txn.expected_version {
            return Err(StoreError::Conflict(format!(
                "version mismatch for {}: expected {}, found {current_version}",
                txn.course_id, txn.expected_version
            )));
        }

        // Apply against a scratch copy so a failing op rolls the whole
        // transaction back.
        let mut scratch = inner.clone();
        for op in txn.ops {
            apply_op(&mut scratch, &txn.course_id, op)?;
        }
        if let Some(config) = scratch.seat_configs.get_mut(&txn.course_id) {
            config.version += 1;
        }
        *inner = scratch;
        Ok(())
    }

    async fn upsert_student(&self, student: &Student) -> StoreResult<()> {
        self.lock()
            .students
            .insert(student.id.clone(), student.clone());
        Ok(())
    }

    async fn upsert_course(&self, course: &Course) -> StoreResult<()> {
        self.lock().courses.insert(course.id.clone(), course.clone());
        Ok(())
    }

    async fn upsert_seat_config(&self, config: &SeatConfig) -> StoreResult<()> {
        self.lock()
            .seat_configs
            .insert(config.course_id.clone(), config.clone());
        Ok(())
    }
}
