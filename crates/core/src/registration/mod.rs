mod service;

#[cfg(test)]
mod service_tests;

pub use service::{
    AllocationReport, ApplyOutcome, AutoEnrollment, AwardedSeat, ClassroomView,
    CourseAvailability, DropOutcome, EnrollmentView, PreferredCourseView, RegistrationService,
    StudentStatusView, WaitlistEntryView, WaitlistPositionView,
};
