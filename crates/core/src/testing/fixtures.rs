//! Pre-built students, courses and seat layouts to avoid duplication across
//! test files.

use chrono::{NaiveTime, Weekday};

use crate::domain::{Course, CourseSchedule, SeatConfig, Student};

/// A plain student; interests and completed courses start empty.
pub fn student(id: &str, gpa: f64, year: u8) -> Student {
    Student {
        id: id.to_string(),
        name: format!("Student {id}"),
        email: format!("{id}@campus.test"),
        gpa,
        major: "Computer Science".to_string(),
        year,
        interests: Default::default(),
        completed_courses: Default::default(),
    }
}

/// A plain course with no prerequisites, tags or preferred years.
pub fn course(id: &str, code: &str) -> Course {
    Course {
        id: id.to_string(),
        code: code.to_string(),
        name: format!("Course {code}"),
        category: "core".to_string(),
        difficulty: "intermediate".to_string(),
        instructor: "instructor-1".to_string(),
        schedule: CourseSchedule {
            days: vec![Weekday::Mon, Weekday::Wed],
            start: NaiveTime::from_hms_opt(10, 0, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(11, 30, 0).expect("valid time"),
        },
        classroom: format!("room-{id}"),
        min_gpa: 0.0,
        prerequisites: Vec::new(),
        tags: Default::default(),
        preferred_years: Default::default(),
    }
}

/// A CLOSED seat grid for a course.
pub fn seat_config(course_id: &str, rows: u32, seats_per_row: u32) -> SeatConfig {
    SeatConfig::new(course_id, rows, seats_per_row)
}
