pub mod errors;
pub mod models;
pub mod seat_label;

pub use errors::{RegistrationError, Result};
pub use models::{
    BookingStatus, Course, CoursePreference, CourseSchedule, RegistrationEvent,
    RegistrationEventType, SeatBooking, SeatConfig, Student, WaitlistEntry, WaitlistStatus,
};
pub use seat_label::{SeatLabel, SeatLabelError};
