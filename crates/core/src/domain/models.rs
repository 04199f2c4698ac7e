use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::errors::{RegistrationError, Result};
use crate::domain::seat_label::SeatLabel;
use crate::scoring::FactorScores;

/// A student as provided by the external intake system. Consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Grade point average in [0.0, 4.0]
    pub gpa: f64,
    pub major: String,
    /// Year of study, 1-based
    pub year: u8,
    pub interests: BTreeSet<String>,
    pub completed_courses: BTreeSet<String>,
}

/// Weekly meeting pattern for a course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseSchedule {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// A course as provided by the external catalog. Consumed read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    /// Human code, e.g. "CS101"
    pub code: String,
    pub name: String,
    pub category: String,
    pub difficulty: String,
    pub instructor: String,
    pub schedule: CourseSchedule,
    pub classroom: String,
    pub min_gpa: f64,
    pub prerequisites: Vec<String>,
    pub tags: BTreeSet<String>,
    pub preferred_years: BTreeSet<u8>,
}

/// Lifecycle state of a course's registration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Closed,
    Open,
    WaitlistOnly,
    Started,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Closed => "CLOSED",
            BookingStatus::Open => "OPEN",
            BookingStatus::WaitlistOnly => "WAITLIST_ONLY",
            BookingStatus::Started => "STARTED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Direct seat booking is only possible while the window is OPEN.
    pub fn accepts_direct_booking(&self) -> bool {
        matches!(self, BookingStatus::Open)
    }

    /// Applications (direct or waitlist) are rejected once the course has started.
    pub fn accepts_applications(&self) -> bool {
        matches!(
            self,
            BookingStatus::Closed | BookingStatus::Open | BookingStatus::WaitlistOnly
        )
    }

    pub fn accepts_drops(&self) -> bool {
        matches!(
            self,
            BookingStatus::Open | BookingStatus::WaitlistOnly | BookingStatus::Started
        )
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CLOSED" => Ok(BookingStatus::Closed),
            "OPEN" => Ok(BookingStatus::Open),
            "WAITLIST_ONLY" => Ok(BookingStatus::WaitlistOnly),
            "STARTED" => Ok(BookingStatus::Started),
            "COMPLETED" => Ok(BookingStatus::Completed),
            _ => Err(RegistrationError::ConfigurationInvalid(format!(
                "unknown booking status: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classroom layout and booking window for one course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatConfig {
    pub course_id: String,
    pub total_seats: u32,
    pub rows: u32,
    pub seats_per_row: u32,
    pub booking_status: BookingStatus,
    pub booking_opens_at: Option<DateTime<Utc>>,
    pub booking_closes_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped on every committed course transaction.
    pub version: i64,
}

impl SeatConfig {
    pub fn new(course_id: impl Into<String>, rows: u32, seats_per_row: u32) -> Self {
        Self {
            course_id: course_id.into(),
            total_seats: rows * seats_per_row,
            rows,
            seats_per_row,
            booking_status: BookingStatus::Closed,
            booking_opens_at: None,
            booking_closes_at: None,
            version: 0,
        }
    }

    /// Invariant checks: grid dimensions multiply out, and rows stay within
    /// the single-letter label grammar.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.seats_per_row == 0 {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "seat grid for {} must have at least one row and one seat per row",
                self.course_id
            )));
        }
        if self.rows > 26 {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "seat grid for {} has {} rows; labels support at most 26 (A-Z)",
                self.course_id, self.rows
            )));
        }
        if self.total_seats != self.rows * self.seats_per_row {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "seat grid for {}: total_seats {} != rows {} * seats_per_row {}",
                self.course_id, self.total_seats, self.rows, self.seats_per_row
            )));
        }
        Ok(())
    }
}

/// An active or historical claim on a single seat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatBooking {
    pub course_id: String,
    pub student_id: String,
    pub seat_label: SeatLabel,
    pub booked_at: DateTime<Utc>,
    pub active: bool,
}

/// Waitlist entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitlistStatus {
    Waiting,
    Processing,
    Allocated,
    Expired,
    Cancelled,
}

impl WaitlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "WAITING",
            WaitlistStatus::Processing => "PROCESSING",
            WaitlistStatus::Allocated => "ALLOCATED",
            WaitlistStatus::Expired => "EXPIRED",
            WaitlistStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal entries no longer occupy the (course, student) uniqueness slot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaitlistStatus::Allocated | WaitlistStatus::Expired | WaitlistStatus::Cancelled
        )
    }
}

impl std::str::FromStr for WaitlistStatus {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "WAITING" => Ok(WaitlistStatus::Waiting),
            "PROCESSING" => Ok(WaitlistStatus::Processing),
            "ALLOCATED" => Ok(WaitlistStatus::Allocated),
            "EXPIRED" => Ok(WaitlistStatus::Expired),
            "CANCELLED" => Ok(WaitlistStatus::Cancelled),
            _ => Err(RegistrationError::ConfigurationInvalid(format!(
                "unknown waitlist status: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for WaitlistStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One student's position in the contention for one course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub course_id: String,
    pub student_id: String,
    pub factors: FactorScores,
    /// Weighted factor sum, rounded to 6 decimals
    pub composite_score: f64,
    pub status: WaitlistStatus,
    pub applied_at: DateTime<Utc>,
    pub preferred_seat: Option<SeatLabel>,
}

/// A recommendation-system output row. Priorities within a student are
/// unique and dense (1..K, 1 = most preferred).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoursePreference {
    pub student_id: String,
    pub course_id: String,
    pub priority: u32,
    pub match_reason: String,
}

/// Validates that `prefs` form a dense 1..K priority ranking for one student.
pub fn validate_preferences(student_id: &str, prefs: &[CoursePreference]) -> Result<()> {
    let mut priorities: Vec<u32> = prefs.iter().map(|p| p.priority).collect();
    priorities.sort_unstable();
    for (idx, priority) in priorities.iter().enumerate() {
        if *priority != (idx + 1) as u32 {
            return Err(RegistrationError::ConfigurationInvalid(format!(
                "preferences for {student_id} must use dense priorities 1..{}",
                prefs.len()
            )));
        }
    }
    let mut courses: Vec<&str> = prefs.iter().map(|p| p.course_id.as_str()).collect();
    courses.sort_unstable();
    courses.dedup();
    if courses.len() != prefs.len() {
        return Err(RegistrationError::ConfigurationInvalid(format!(
            "preferences for {student_id} repeat a course"
        )));
    }
    Ok(())
}

/// Kinds of state changes broadcast to subscribers and appended to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationEventType {
    SeatBooked,
    SeatReleased,
    WaitlistUpdated,
    BookingStatusChanged,
    StudentAutoEnrolled,
}

impl RegistrationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationEventType::SeatBooked => "SEAT_BOOKED",
            RegistrationEventType::SeatReleased => "SEAT_RELEASED",
            RegistrationEventType::WaitlistUpdated => "WAITLIST_UPDATED",
            RegistrationEventType::BookingStatusChanged => "BOOKING_STATUS_CHANGED",
            RegistrationEventType::StudentAutoEnrolled => "STUDENT_AUTO_ENROLLED",
        }
    }
}

impl std::fmt::Display for RegistrationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationEvent {
    pub event_type: RegistrationEventType,
    pub student_id: Option<String>,
    pub course_id: String,
    pub seat_label: Option<SeatLabel>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
