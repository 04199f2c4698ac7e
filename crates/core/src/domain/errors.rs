use thiserror::Error;

use crate::domain::seat_label::SeatLabel;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("student not found: {0}")]
    StudentNotFound(String),

    #[error("course not found: {0}")]
    CourseNotFound(String),

    #[error("missing prerequisites for {course_id}: {missing:?}")]
    PrerequisiteMissing {
        course_id: String,
        missing: Vec<String>,
    },

    #[error("student {student_id} already holds a seat in {course_id}")]
    AlreadyEnrolled {
        student_id: String,
        course_id: String,
    },

    #[error("student {student_id} is already waitlisted for {course_id}")]
    AlreadyWaitlisted {
        student_id: String,
        course_id: String,
    },

    #[error("seat {seat} is already taken")]
    SeatTaken { seat: SeatLabel },

    #[error("invalid seat label: {0}")]
    InvalidSeatLabel(String),

    #[error("booking is closed for course {0}")]
    BookingClosed(String),

    #[error("booking is already open for course {0}")]
    BookingAlreadyOpen(String),

    #[error("course {0} is at capacity")]
    CapacityExceeded(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RegistrationError {
    /// Stable machine code reported on every error response.
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::StudentNotFound(_) | RegistrationError::CourseNotFound(_) => {
                "NOT_FOUND"
            }
            RegistrationError::PrerequisiteMissing { .. } => "PREREQUISITE_MISSING",
            RegistrationError::AlreadyEnrolled { .. } => "ALREADY_ENROLLED",
            RegistrationError::AlreadyWaitlisted { .. } => "ALREADY_WAITLISTED",
            RegistrationError::SeatTaken { .. } => "SEAT_TAKEN",
            RegistrationError::InvalidSeatLabel(_) => "INVALID_SEAT_LABEL",
            RegistrationError::BookingClosed(_) => "BOOKING_CLOSED",
            RegistrationError::BookingAlreadyOpen(_) => "BOOKING_ALREADY_OPEN",
            RegistrationError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            RegistrationError::ConfigurationInvalid(_) => "CONFIGURATION_INVALID",
            RegistrationError::Conflict(_) => "CONFLICT",
            RegistrationError::Timeout => "TIMEOUT",
            RegistrationError::Internal(_) => "INTERNAL",
        }
    }

    /// Domain rejections are expected outcomes of a well-formed request, as
    /// opposed to faults.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RegistrationError::PrerequisiteMissing { .. }
                | RegistrationError::AlreadyEnrolled { .. }
                | RegistrationError::AlreadyWaitlisted { .. }
                | RegistrationError::SeatTaken { .. }
                | RegistrationError::BookingClosed(_)
                | RegistrationError::BookingAlreadyOpen(_)
                | RegistrationError::CapacityExceeded(_)
        )
    }
}

impl From<StoreError> for RegistrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => RegistrationError::Conflict(msg),
            StoreError::NotFound(msg) => {
                RegistrationError::Internal(anyhow::anyhow!("store row vanished: {msg}"))
            }
            StoreError::Other(err) => RegistrationError::Internal(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
