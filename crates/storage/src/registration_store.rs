//! SQLite implementation of the registration store port.

use async_trait::async_trait;
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};

use enroll_core::ports::registration_store::StoreResult;
use enroll_core::{
    Course, CoursePreference, CourseTxn, RegistrationStore, SeatBooking, SeatConfig, StoreError,
    Student, TxnOp, WaitlistEntry, WaitlistStatus,
};

use crate::models::{
    CoursePreferenceRow, CourseRow, SeatBookingRow, SeatConfigRow, StudentRow, WaitlistEntryRow,
};

pub struct SqliteRegistrationStore {
    pool: SqlitePool,
}

/// Maps unique-constraint violations to `Conflict`; everything else is an
/// internal store fault.
fn map_db_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return StoreError::Conflict(db_err.message().to_string());
        }
    }
    StoreError::Other(err.into())
}

fn corrupt(err: anyhow::Error) -> StoreError {
    StoreError::Other(err)
}

impl SqliteRegistrationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn apply_op(
        tx: &mut Transaction<'_, Sqlite>,
        course_id: &str,
        op: &TxnOp,
    ) -> StoreResult<()> {
        match op {
            TxnOp::InsertBooking(booking) => {
                query(
                    "INSERT INTO seat_bookings (course_id, student_id, seat_label, booked_at, active)
                     VALUES (?, ?, ?, ?, 1)",
                )
                .bind(&booking.course_id)
                .bind(&booking.student_id)
                .bind(booking.seat_label.to_string())
                .bind(booking.booked_at.timestamp_millis())
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
            TxnOp::DeactivateBooking { student_id } => {
                query(
                    "UPDATE seat_bookings SET active = 0
                     WHERE course_id = ? AND student_id = ? AND active = 1",
                )
                .bind(course_id)
                .bind(student_id)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
            TxnOp::InsertWaitlistEntry(entry) => {
                query(
                    "INSERT INTO waitlist_entries
                     (course_id, student_id, gpa_score, interest_score, time_score,
                      year_score, prereq_score, composite_score, status, applied_at, preferred_seat)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&entry.course_id)
                .bind(&entry.student_id)
                .bind(entry.factors.gpa)
                .bind(entry.factors.interest)
                .bind(entry.factors.time)
                .bind(entry.factors.year)
                .bind(entry.factors.prereq)
                .bind(entry.composite_score)
                .bind(entry.status.as_str())
                .bind(entry.applied_at.timestamp_millis())
                .bind(entry.preferred_seat.map(|s| s.to_string()))
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
            TxnOp::SetWaitlistStatus { student_id, status } => {
                query(
                    "UPDATE waitlist_entries SET status = ?
                     WHERE course_id = ? AND student_id = ?
                       AND status IN ('WAITING', 'PROCESSING')",
                )
                .bind(status.as_str())
                .bind(course_id)
                .bind(student_id)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
            TxnOp::SetBookingStatus { status, opened_at } => {
                query(
                    "UPDATE seat_configs SET booking_status = ?, booking_opens_at = ?
                     WHERE course_id = ?",
                )
                .bind(status.as_str())
                .bind(opened_at.map(|t| t.timestamp_millis()))
                .bind(course_id)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
            TxnOp::AppendEvent(record) => {
                query(
                    "INSERT INTO registration_events
                     (event_type, student_id, course_id, seat_label, metadata, timestamp)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(record.event_type.as_str())
                .bind(record.student_id.as_deref())
                .bind(&record.course_id)
                .bind(record.seat_label.map(|s| s.to_string()))
                .bind(record.metadata.to_string())
                .bind(record.timestamp.timestamp_millis())
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;
            }
        }
        Ok(())
    }

    /// Audit records for one course, in append order. Not part of the port;
    /// used by operators and tests.
    pub async fn events_for_course(
        &self,
        course_id: &str,
    ) -> StoreResult<Vec<serde_json::Value>> {
        let rows = query_as::<_, (String, Option<String>, Option<String>, String, i64)>(
            "SELECT event_type, student_id, seat_label, metadata, timestamp
             FROM registration_events WHERE course_id = ? ORDER BY id ASC",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(rows
            .into_iter()
            .map(|(event_type, student_id, seat_label, metadata, timestamp)| {
                serde_json::json!({
                    "eventType": event_type,
                    "studentId": student_id,
                    "seatLabel": seat_label,
                    "metadata": serde_json::from_str::<serde_json::Value>(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                    "timestamp": timestamp,
                })
            })
            .collect())
    }
}

#[async_trait]
impl RegistrationStore for SqliteRegistrationStore {
    async fn get_student(&self, student_id: &str) -> StoreResult<Option<Student>> {
        let row = query_as::<_, StudentRow>(
            "SELECT id, name, email, gpa, major, year, interests, completed_courses
             FROM students WHERE id = ?",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(Student::try_from).transpose().map_err(corrupt)
    }

    async fn get_course(&self, id_or_code: &str) -> StoreResult<Option<Course>> {
        let row = query_as::<_, CourseRow>(
            "SELECT id, code, name, category, difficulty, instructor, schedule,
                    classroom, min_gpa, prerequisites, tags, preferred_years
             FROM courses WHERE id = ? OR code = ?",
        )
        .bind(id_or_code)
        .bind(id_or_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(Course::try_from).transpose().map_err(corrupt)
    }

    async fn list_courses(&self) -> StoreResult<Vec<Course>> {
        let rows = query_as::<_, CourseRow>(
            "SELECT id, code, name, category, difficulty, instructor, schedule,
                    classroom, min_gpa, prerequisites, tags, preferred_years
             FROM courses ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter()
            .map(|row| Course::try_from(row).map_err(corrupt))
            .collect()
    }

    async fn get_seat_config(&self, course_id: &str) -> StoreResult<Option<SeatConfig>> {
        let row = query_as::<_, SeatConfigRow>(
            "SELECT course_id, total_seats, rows, seats_per_row, booking_status,
                    booking_opens_at, booking_closes_at, version
             FROM seat_configs WHERE course_id = ?",
        )
        .bind(course_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(SeatConfig::try_from).transpose().map_err(corrupt)
    }

    async fn active_bookings(&self, course_id: &str) -> StoreResult<Vec<SeatBooking>> {
        let rows = query_as::<_, SeatBookingRow>(
            "SELECT course_id, student_id, seat_label, booked_at, active
             FROM seat_bookings WHERE course_id = ? AND active = 1
             ORDER BY id ASC",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter()
            .map(|row| SeatBooking::try_from(row).map_err(corrupt))
            .collect()
    }

    async fn active_booking_for(
        &self,
        course_id: &str,
        student_id: &str,
    ) -> StoreResult<Option<SeatBooking>> {
        let row = query_as::<_, SeatBookingRow>(
            "SELECT course_id, student_id, seat_label, booked_at, active
             FROM seat_bookings
             WHERE course_id = ? AND student_id = ? AND active = 1",
        )
        .bind(course_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.map(SeatBooking::try_from).transpose().map_err(corrupt)
    }

    async fn waiting_entries(&self, course_id: &str) -> StoreResult<Vec<WaitlistEntry>> {
        let rows = query_as::<_, WaitlistEntryRow>(
            "SELECT course_id, student_id, gpa_score, interest_score, time_score,
                    year_score, prereq_score, composite_score, status, applied_at, preferred_seat
             FROM waitlist_entries WHERE course_id = ? AND status = ?
             ORDER BY composite_score DESC, applied_at ASC, student_id ASC",
        )
        .bind(course_id)
        .bind(WaitlistStatus::Waiting.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter()
            .map(|row| WaitlistEntry::try_from(row).map_err(corrupt))
            .collect()
    }

    async fn active_bookings_for_student(
        &self,
        student_id: &str,
    ) -> StoreResult<Vec<SeatBooking>> {
        let rows = query_as::<_, SeatBookingRow>(
            "SELECT course_id, student_id, seat_label, booked_at, active
             FROM seat_bookings WHERE student_id = ? AND active = 1
             ORDER BY course_id ASC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.into_iter()
            .map(|row| SeatBooking::try_from(row).map_err(corrupt))
            .collect()
    }

    async fn preferences_for(&self, student_id: &str) -> StoreResult<Vec<CoursePreference>> {
        let rows = query_as::<_, CoursePreferenceRow>(
            "SELECT student_id, course_id, priority, match_reason
             FROM course_preferences WHERE student_id = ?
             ORDER BY priority ASC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(rows.into_iter().map(CoursePreference::from).collect())
    }

    async fn replace_preferences(
        &self,
        student_id: &str,
        prefs: &[CoursePreference],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        query("DELETE FROM course_preferences WHERE student_id = ?")
            .bind(student_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        for pref in prefs {
            query(
                "INSERT INTO course_preferences (student_id, course_id, priority, match_reason)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(student_id)
            .bind(&pref.course_id)
            .bind(pref.priority as i64)
            .bind(&pref.match_reason)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)
    }

    async fn commit(&self, txn: CourseTxn) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        // Optimistic bump-and-check: no matching row means someone else
        // committed first (or the course is unknown).
        let bumped = query(
            "UPDATE seat_configs SET version = version + 1
             WHERE course_id = ? AND version = ?",
        )
        .bind(&txn.course_id)
        .bind(txn.expected_version)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;
        if bumped.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "version {} no longer current for course {}",
                txn.expected_version, txn.course_id
            )));
        }

        for op in &txn.ops {
            Self::apply_op(&mut tx, &txn.course_id, op).await?;
        }

        tx.commit().await.map_err(map_db_err)
    }

    async fn upsert_student(&self, student: &Student) -> StoreResult<()> {
        query(
            "INSERT INTO students (id, name, email, gpa, major, year, interests, completed_courses)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                gpa = excluded.gpa,
                major = excluded.major,
                year = excluded.year,
                interests = excluded.interests,
                completed_courses = excluded.completed_courses",
        )
        .bind(&student.id)
        .bind(&student.name)
        .bind(&student.email)
        .bind(student.gpa)
        .bind(&student.major)
        .bind(student.year as i64)
        .bind(serde_json::to_string(&student.interests).map_err(|e| StoreError::Other(e.into()))?)
        .bind(
            serde_json::to_string(&student.completed_courses)
                .map_err(|e| StoreError::Other(e.into()))?,
        )
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn upsert_course(&self, course: &Course) -> StoreResult<()> {
        query(
            "INSERT INTO courses
             (id, code, name, category, difficulty, instructor, schedule, classroom,
              min_gpa, prerequisites, tags, preferred_years)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                code = excluded.code,
                name = excluded.name,
                category = excluded.category,
                difficulty = excluded.difficulty,
                instructor = excluded.instructor,
                schedule = excluded.schedule,
                classroom = excluded.classroom,
                min_gpa = excluded.min_gpa,
                prerequisites = excluded.prerequisites,
                tags = excluded.tags,
                preferred_years = excluded.preferred_years",
        )
        .bind(&course.id)
        .bind(&course.code)
        .bind(&course.name)
        .bind(&course.category)
        .bind(&course.difficulty)
        .bind(&course.instructor)
        .bind(serde_json::to_string(&course.schedule).map_err(|e| StoreError::Other(e.into()))?)
        .bind(&course.classroom)
        .bind(course.min_gpa)
        .bind(
            serde_json::to_string(&course.prerequisites)
                .map_err(|e| StoreError::Other(e.into()))?,
        )
        .bind(serde_json::to_string(&course.tags).map_err(|e| StoreError::Other(e.into()))?)
        .bind(
            serde_json::to_string(&course.preferred_years)
                .map_err(|e| StoreError::Other(e.into()))?,
        )
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn upsert_seat_config(&self, config: &SeatConfig) -> StoreResult<()> {
        query(
            "INSERT INTO seat_configs
             (course_id, total_seats, rows, seats_per_row, booking_status,
              booking_opens_at, booking_closes_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(course_id) DO UPDATE SET
                total_seats = excluded.total_seats,
                rows = excluded.rows,
                seats_per_row = excluded.seats_per_row,
                booking_status = excluded.booking_status,
                booking_opens_at = excluded.booking_opens_at,
                booking_closes_at = excluded.booking_closes_at",
        )
        .bind(&config.course_id)
        .bind(config.total_seats as i64)
        .bind(config.rows as i64)
        .bind(config.seats_per_row as i64)
        .bind(config.booking_status.as_str())
        .bind(config.booking_opens_at.map(|t| t.timestamp_millis()))
        .bind(config.booking_closes_at.map(|t| t.timestamp_millis()))
        .bind(config.version)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }
}
