pub mod allocation;
pub mod config;
pub mod domain;
pub mod events;
pub mod ports;
pub mod registration;
pub mod scoring;
pub mod seatmap;
pub mod waitlist;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use domain::{
    BookingStatus, Course, CoursePreference, CourseSchedule, RegistrationError, RegistrationEvent,
    RegistrationEventType, Result, SeatBooking, SeatConfig, SeatLabel, SeatLabelError, Student,
    WaitlistEntry, WaitlistStatus,
};

pub use config::{AllocationStrategy, EngineConfig, ScoreWeights};

pub use scoring::{score, FactorScores, ScoreBreakdown};

pub use events::{CourseEvent, EventBus};

pub use ports::{CourseTxn, RegistrationStore, StoreError, TxnOp};

pub use registration::{ApplyOutcome, DropOutcome, RegistrationService};

pub use allocation::{AllocationInput, AllocationOutcome, CourseSnapshot, SeatAward};

pub use seatmap::{ClassroomState, SeatMapStore, SeatState};

pub use waitlist::{WaitlistKey, WaitlistStore};
