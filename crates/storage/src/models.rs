/// Database row types and their conversions into domain entities.
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use enroll_core::scoring::FactorScores;
use enroll_core::{
    BookingStatus, Course, CoursePreference, SeatBooking, SeatConfig, SeatLabel, Student,
    WaitlistEntry, WaitlistStatus,
};

fn millis_to_datetime(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| anyhow!("timestamp out of range: {millis}"))
}

#[derive(Debug, Clone, FromRow)]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub gpa: f64,
    pub major: String,
    pub year: i64,
    pub interests: String,
    pub completed_courses: String,
}

impl TryFrom<StudentRow> for Student {
    type Error = anyhow::Error;

    fn try_from(row: StudentRow) -> anyhow::Result<Self> {
        Ok(Student {
            id: row.id,
            name: row.name,
            email: row.email,
            gpa: row.gpa,
            major: row.major,
            year: row.year as u8,
            interests: serde_json::from_str(&row.interests).context("interests column")?,
            completed_courses: serde_json::from_str(&row.completed_courses)
                .context("completed_courses column")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CourseRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub category: String,
    pub difficulty: String,
    pub instructor: String,
    pub schedule: String,
    pub classroom: String,
    pub min_gpa: f64,
    pub prerequisites: String,
    pub tags: String,
    pub preferred_years: String,
}

impl TryFrom<CourseRow> for Course {
    type Error = anyhow::Error;

    fn try_from(row: CourseRow) -> anyhow::Result<Self> {
        Ok(Course {
            id: row.id,
            code: row.code,
            name: row.name,
            category: row.category,
            difficulty: row.difficulty,
            instructor: row.instructor,
            schedule: serde_json::from_str(&row.schedule).context("schedule column")?,
            classroom: row.classroom,
            min_gpa: row.min_gpa,
            prerequisites: serde_json::from_str(&row.prerequisites)
                .context("prerequisites column")?,
            tags: serde_json::from_str(&row.tags).context("tags column")?,
            preferred_years: serde_json::from_str(&row.preferred_years)
                .context("preferred_years column")?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SeatConfigRow {
    pub course_id: String,
    pub total_seats: i64,
    pub rows: i64,
    pub seats_per_row: i64,
    pub booking_status: String,
    pub booking_opens_at: Option<i64>,
    pub booking_closes_at: Option<i64>,
    pub version: i64,
}

impl TryFrom<SeatConfigRow> for SeatConfig {
    type Error = anyhow::Error;

    fn try_from(row: SeatConfigRow) -> anyhow::Result<Self> {
        let booking_status: BookingStatus = row
            .booking_status
            .parse()
            .map_err(|e| anyhow!("booking_status column: {e}"))?;
        Ok(SeatConfig {
            course_id: row.course_id,
            total_seats: row.total_seats as u32,
            rows: row.rows as u32,
            seats_per_row: row.seats_per_row as u32,
            booking_status,
            booking_opens_at: row.booking_opens_at.map(millis_to_datetime).transpose()?,
            booking_closes_at: row.booking_closes_at.map(millis_to_datetime).transpose()?,
            version: row.version,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SeatBookingRow {
    pub course_id: String,
    pub student_id: String,
    pub seat_label: String,
    pub booked_at: i64,
    pub active: i64,
}

impl TryFrom<SeatBookingRow> for SeatBooking {
    type Error = anyhow::Error;

    fn try_from(row: SeatBookingRow) -> anyhow::Result<Self> {
        let seat_label: SeatLabel = row
            .seat_label
            .parse()
            .map_err(|e| anyhow!("seat_label column: {e}"))?;
        Ok(SeatBooking {
            course_id: row.course_id,
            student_id: row.student_id,
            seat_label,
            booked_at: millis_to_datetime(row.booked_at)?,
            active: row.active != 0,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WaitlistEntryRow {
    pub course_id: String,
    pub student_id: String,
    pub gpa_score: f64,
    pub interest_score: f64,
    pub time_score: f64,
    pub year_score: f64,
    pub prereq_score: f64,
    pub composite_score: f64,
    pub status: String,
    pub applied_at: i64,
    pub preferred_seat: Option<String>,
}

impl TryFrom<WaitlistEntryRow> for WaitlistEntry {
    type Error = anyhow::Error;

    fn try_from(row: WaitlistEntryRow) -> anyhow::Result<Self> {
        let status: WaitlistStatus = row
            .status
            .parse()
            .map_err(|e| anyhow!("status column: {e}"))?;
        let preferred_seat = row
            .preferred_seat
            .map(|s| s.parse::<SeatLabel>())
            .transpose()
            .map_err(|e| anyhow!("preferred_seat column: {e}"))?;
        Ok(WaitlistEntry {
            course_id: row.course_id,
            student_id: row.student_id,
            factors: FactorScores {
                gpa: row.gpa_score,
                interest: row.interest_score,
                time: row.time_score,
                year: row.year_score,
                prereq: row.prereq_score,
            },
            composite_score: row.composite_score,
            status,
            applied_at: millis_to_datetime(row.applied_at)?,
            preferred_seat,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CoursePreferenceRow {
    pub student_id: String,
    pub course_id: String,
    pub priority: i64,
    pub match_reason: String,
}

impl From<CoursePreferenceRow> for CoursePreference {
    fn from(row: CoursePreferenceRow) -> Self {
        CoursePreference {
            student_id: row.student_id,
            course_id: row.course_id,
            priority: row.priority as u32,
            match_reason: row.match_reason,
        }
    }
}
