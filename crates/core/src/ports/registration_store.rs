use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    BookingStatus, Course, CoursePreference, RegistrationEvent, SeatBooking, SeatConfig, Student,
    WaitlistEntry, WaitlistStatus,
};

/// Errors surfaced by a store implementation. `Conflict` is the only variant
/// the registration service reacts to specially: it drives the single
/// in-lock retry of the enclosing operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One mutation inside a course transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    InsertBooking(SeatBooking),
    /// Marks the student's active booking inactive.
    DeactivateBooking { student_id: String },
    InsertWaitlistEntry(WaitlistEntry),
    /// Transitions the student's non-terminal waitlist entry.
    SetWaitlistStatus {
        student_id: String,
        status: WaitlistStatus,
    },
    SetBookingStatus {
        status: BookingStatus,
        opened_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Appends an audit record. Ordered with the other ops so the log
    /// matches the committed state.
    AppendEvent(RegistrationEvent),
}

/// A transactional batch of mutations keyed by a single course. The whole
/// batch commits or none of it does. `expected_version` is checked against
/// the course's seat-config row and bumped on success; a mismatch yields
/// [`StoreError::Conflict`].
#[derive(Debug, Clone)]
pub struct CourseTxn {
    pub course_id: String,
    pub expected_version: i64,
    pub ops: Vec<TxnOp>,
}

impl CourseTxn {
    pub fn new(course_id: impl Into<String>, expected_version: i64) -> Self {
        Self {
            course_id: course_id.into(),
            expected_version,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: TxnOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The persistent record store the registration core runs against.
///
/// Students and courses are created by external collaborators and consumed
/// read-only here; the upserts exist for those collaborators and for tests.
/// Uniqueness constraints from the data model are enforced by the
/// implementation and reported as [`StoreError::Conflict`].
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn get_student(&self, student_id: &str) -> StoreResult<Option<Student>>;

    /// Resolves a course by opaque id or human code (e.g. `CS101`).
    async fn get_course(&self, id_or_code: &str) -> StoreResult<Option<Course>>;

    async fn list_courses(&self) -> StoreResult<Vec<Course>>;

    async fn get_seat_config(&self, course_id: &str) -> StoreResult<Option<SeatConfig>>;

    /// Active bookings for one course, for seat-map rehydration.
    async fn active_bookings(&self, course_id: &str) -> StoreResult<Vec<SeatBooking>>;

    async fn active_booking_for(
        &self,
        course_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<SeatBooking>>;

    /// WAITING entries for one course, for waitlist rehydration.
    async fn waiting_entries(&self, course_id: &str) -> StoreResult<Vec<WaitlistEntry>>;

    async fn active_bookings_for_student(&self, student_id: &str)
        -> StoreResult<Vec<SeatBooking>>;

    async fn preferences_for(&self, student_id: &str) -> StoreResult<Vec<CoursePreference>>;

    /// Replaces a student's preference list en bloc.
    async fn replace_preferences(
        &self,
        student_id: &str,
        prefs: &[CoursePreference],
    ) -> StoreResult<()>;

    /// Applies a course-keyed transactional batch.
    async fn commit(&self, txn: CourseTxn) -> StoreResult<()>;

    // ========================================================================
    // Intake (external collaborators and tests)
    // ========================================================================

    async fn upsert_student(&self, student: &Student) -> StoreResult<()>;

    async fn upsert_course(&self, course: &Course) -> StoreResult<()>;

    async fn upsert_seat_config(&self, config: &SeatConfig) -> StoreResult<()>;
}
