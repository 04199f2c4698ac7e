//! The transactional registration core.
//!
//! Every state-mutating operation runs inside its course's critical section:
//! the store commit happens first, the in-memory stores are updated second,
//! and events are published last, so a subscriber that queries after an event
//! always observes the committed state. Multi-course allocation acquires all
//! involved course locks in sorted identifier order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::allocation::{self, AllocationInput, CourseSnapshot};
use crate::config::EngineConfig;
use crate::domain::models::validate_preferences;
use crate::domain::{
    BookingStatus, Course, CoursePreference, RegistrationError, RegistrationEvent,
    RegistrationEventType, Result, SeatBooking, SeatConfig, SeatLabel, Student, WaitlistEntry,
    WaitlistStatus,
};
use crate::events::{CourseEvent, EventBus};
use crate::ports::{CourseTxn, RegistrationStore, StoreError, TxnOp};
use crate::scoring::{self, FactorScores};
use crate::seatmap::{ClassroomState, SeatMapStore};
use crate::waitlist::WaitlistStore;

/// Result of a successful `apply`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApplyOutcome {
    #[serde(rename_all = "camelCase")]
    Enrolled {
        seat_label: SeatLabel,
        composite_score: f64,
    },
    #[serde(rename_all = "camelCase")]
    Waitlisted {
        composite_score: f64,
        /// 1-based waitlist position
        position: usize,
    },
}

/// One waitlist promotion performed by dropout auto-fill.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoEnrollment {
    pub student_id: String,
    pub seat_label: SeatLabel,
}

/// Result of `drop_enrollment`. A second drop of the same student is a
/// no-op with `released_seat: None`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropOutcome {
    pub released_seat: Option<SeatLabel>,
    pub auto_enrolled: Vec<AutoEnrollment>,
}

/// One committed allocation grant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AwardedSeat {
    pub course_id: String,
    pub student_id: String,
    pub seat_label: SeatLabel,
}

/// Result of a batch allocation run. When cancelled cooperatively,
/// `cancelled` is true and `awards` holds the per-course allocations that
/// had already committed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationReport {
    pub awards: Vec<AwardedSeat>,
    pub cancelled: bool,
}

/// Course listing row with availability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseAvailability {
    pub course: Course,
    pub booking_status: BookingStatus,
    pub total_seats: u32,
    pub occupied: u32,
    pub available: u32,
    pub waitlist_size: usize,
}

/// Classroom snapshot plus course identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomView {
    pub course_id: String,
    pub booking_status: BookingStatus,
    #[serde(flatten)]
    pub state: ClassroomState,
}

/// One row of the top-N waitlist query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistEntryView {
    pub rank: usize,
    pub student_id: String,
    pub composite_score: f64,
    pub factors: FactorScores,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentView {
    pub course_id: String,
    pub course_code: String,
    pub course_name: String,
    pub seat_label: SeatLabel,
    pub booked_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistPositionView {
    pub course_id: String,
    pub rank: usize,
    pub composite_score: f64,
}

/// Aggregate answer for the student status query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatusView {
    pub student_id: String,
    pub enrollments: Vec<EnrollmentView>,
    pub waitlists: Vec<WaitlistPositionView>,
    pub preferences: Vec<CoursePreference>,
}

/// Preference joined with its course, for the recommendation query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferredCourseView {
    pub course: Course,
    pub priority: u32,
    pub match_reason: String,
}

/// Cached course + seat config, kept in sync with the store under the
/// course lock.
#[derive(Debug, Clone)]
struct CourseRuntime {
    course: Course,
    seats: SeatConfig,
}

/// Per-course plan built by `run_allocation` before any commit.
#[derive(Default)]
struct CoursePlan {
    bookings: Vec<SeatBooking>,
    cancelled_students: Vec<String>,
    new_status: Option<BookingStatus>,
    records: Vec<RegistrationEvent>,
}

/// The registration engine. Construction fails fast on invalid
/// configuration; call [`load_courses`](Self::load_courses) once at startup
/// to rehydrate in-memory state from the store.
pub struct RegistrationService {
    store: Arc<dyn RegistrationStore>,
    config: EngineConfig,
    waitlists: WaitlistStore,
    seat_maps: SeatMapStore,
    events: EventBus,
    runtimes: DashMap<String, CourseRuntime>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for RegistrationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationService").finish()
    }
}

impl RegistrationService {
    pub fn new(store: Arc<dyn RegistrationStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            waitlists: WaitlistStore::new(),
            seat_maps: SeatMapStore::new(),
            events: EventBus::new(),
            runtimes: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Rehydrates every course known to the store. Seat maps and waitlists
    /// are rebuilt from active bookings and WAITING entries so that
    /// post-restart snapshots reflect all previously committed events.
    pub async fn load_courses(&self) -> Result<()> {
        let courses = self.store.list_courses().await?;
        let count = courses.len();
        for course in courses {
            self.hydrate(course).await?;
        }
        info!(count, "courses rehydrated");
        Ok(())
    }

    async fn hydrate(&self, course: Course) -> Result<()> {
        let seats = match self.store.get_seat_config(&course.id).await? {
            Some(config) => config,
            None => {
                // Courses arriving from intake without a layout get the
                // configured default grid.
                let config = SeatConfig::new(
                    course.id.clone(),
                    self.config.default_rows,
                    self.config.default_seats_per_row,
                );
                self.store.upsert_seat_config(&config).await?;
                config
            }
        };
        seats.validate()?;

        self.seat_maps
            .init_course(&course.id, seats.rows, seats.seats_per_row);
        for booking in self.store.active_bookings(&course.id).await? {
            self.seat_maps
                .occupy(&course.id, &booking.seat_label, &booking.student_id)?;
        }

        self.waitlists.drain(&course.id);
        for entry in self.store.waiting_entries(&course.id).await? {
            self.waitlists.insert(entry)?;
        }

        self.runtimes
            .insert(course.id.clone(), CourseRuntime { course, seats });
        Ok(())
    }

    /// Re-reads one course from the store. Used before the single retry
    /// after a `Conflict`.
    async fn resync(&self, course_id: &str) -> Result<()> {
        let course = self
            .store
            .get_course(course_id)
            .await?
            .ok_or_else(|| RegistrationError::CourseNotFound(course_id.to_string()))?;
        self.hydrate(course).await
    }

    /// Resolves an opaque id or human code (`CS101`) to the canonical id,
    /// hydrating the course on first sight.
    async fn resolve_course_id(&self, id_or_code: &str) -> Result<String> {
        if self.runtimes.contains_key(id_or_code) {
            return Ok(id_or_code.to_string());
        }
        if let Some(entry) = self
            .runtimes
            .iter()
            .find(|entry| entry.value().course.code == id_or_code)
        {
            return Ok(entry.key().clone());
        }
        let course = self
            .store
            .get_course(id_or_code)
            .await?
            .ok_or_else(|| RegistrationError::CourseNotFound(id_or_code.to_string()))?;
        let course_id = course.id.clone();
        if !self.runtimes.contains_key(&course_id) {
            self.hydrate(course).await?;
        }
        Ok(course_id)
    }

    fn runtime(&self, course_id: &str) -> Result<CourseRuntime> {
        self.runtimes
            .get(course_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistrationError::CourseNotFound(course_id.to_string()))
    }

    fn update_seats<F: FnOnce(&mut SeatConfig)>(&self, course_id: &str, f: F) {
        if let Some(mut entry) = self.runtimes.get_mut(course_id) {
            f(&mut entry.seats);
        }
    }

    // ========================================================================
    // Locking
    // ========================================================================

    fn lock_handle(&self, course_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(course_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock_course(&self, course_id: &str) -> Result<OwnedMutexGuard<()>> {
        let handle = self.lock_handle(course_id);
        tokio::time::timeout(self.config.request_timeout, handle.lock_owned())
            .await
            .map_err(|_| RegistrationError::Timeout)
    }

    /// Acquires several course locks in sorted identifier order. `ids` must
    /// already be sorted and deduplicated.
    async fn lock_courses(&self, ids: &[String]) -> Result<Vec<OwnedMutexGuard<()>>> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_course(id).await?);
        }
        Ok(guards)
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn record(
        event_type: RegistrationEventType,
        course_id: &str,
        student_id: Option<&str>,
        seat_label: Option<SeatLabel>,
        metadata: serde_json::Value,
    ) -> RegistrationEvent {
        RegistrationEvent {
            event_type,
            student_id: student_id.map(str::to_string),
            course_id: course_id.to_string(),
            seat_label,
            metadata,
            timestamp: Utc::now(),
        }
    }

    fn wire_event(record: &RegistrationEvent) -> CourseEvent {
        let mut payload = match &record.metadata {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("metadata".to_string(), other.clone());
                map
            }
        };
        if let Some(student_id) = &record.student_id {
            payload.insert("studentId".to_string(), json!(student_id));
        }
        if let Some(seat) = &record.seat_label {
            payload.insert("seatLabel".to_string(), json!(seat.to_string()));
        }
        CourseEvent {
            event_type: record.event_type,
            course_id: record.course_id.clone(),
            payload: serde_json::Value::Object(payload),
            timestamp: record.timestamp,
        }
    }

    /// Publishes audit records to the course topics, in order. Called only
    /// after the records' transaction has committed.
    fn publish_records(&self, records: &[RegistrationEvent]) {
        for record in records {
            self.events.publish(Self::wire_event(record));
        }
    }

    // ========================================================================
    // apply
    // ========================================================================

    /// Registers interest in a course: a direct seat when the window is
    /// open, a seat is free and `auto_register` is set, otherwise a scored
    /// waitlist entry.
    #[instrument(skip(self), fields(student_id, course))]
    pub async fn apply(
        &self,
        student_id: &str,
        course: &str,
        preferred_seat: Option<SeatLabel>,
        auto_register: bool,
    ) -> Result<ApplyOutcome> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        match self
            .apply_inner(student_id, &course_id, preferred_seat, auto_register)
            .await
        {
            Err(RegistrationError::Conflict(reason)) => {
                warn!(%course_id, %reason, "conflict during apply, retrying once");
                self.resync(&course_id).await?;
                self.apply_inner(student_id, &course_id, preferred_seat, auto_register)
                    .await
            }
            result => result,
        }
    }

    async fn apply_inner(
        &self,
        student_id: &str,
        course_id: &str,
        preferred_seat: Option<SeatLabel>,
        auto_register: bool,
    ) -> Result<ApplyOutcome> {
        let student = self.require_student(student_id).await?;
        let runtime = self.runtime(course_id)?;

        if !runtime.seats.booking_status.accepts_applications() {
            return Err(RegistrationError::BookingClosed(course_id.to_string()));
        }

        let missing: Vec<String> = runtime
            .course
            .prerequisites
            .iter()
            .filter(|p| !student.completed_courses.contains(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RegistrationError::PrerequisiteMissing {
                course_id: course_id.to_string(),
                missing,
            });
        }

        if self.seat_maps.occupant_seat(course_id, student_id).is_some() {
            return Err(RegistrationError::AlreadyEnrolled {
                student_id: student_id.to_string(),
                course_id: course_id.to_string(),
            });
        }
        if self.waitlists.rank_of(course_id, student_id).is_some() {
            return Err(RegistrationError::AlreadyWaitlisted {
                student_id: student_id.to_string(),
                course_id: course_id.to_string(),
            });
        }

        if let Some(seat) = &preferred_seat {
            if !self.seat_maps.label_is_valid(course_id, seat) {
                return Err(RegistrationError::InvalidSeatLabel(seat.to_string()));
            }
        }

        let applied_at = Utc::now();
        let breakdown = scoring::score(
            &student,
            &runtime.course,
            applied_at,
            runtime.seats.booking_opens_at,
            &self.config.score_weights,
            self.config.time_decay_lambda,
        );

        let direct = runtime.seats.booking_status == BookingStatus::Open
            && auto_register
            && !self.seat_maps.is_full(course_id);

        if direct {
            // Preferred seat when free, else the canonical lowest free seat.
            let seat = preferred_seat
                .filter(|s| self.seat_maps.seat_is_free(course_id, s))
                .or_else(|| self.seat_maps.pick_lowest_free(course_id))
                .ok_or_else(|| RegistrationError::CapacityExceeded(course_id.to_string()))?;
            let booking = SeatBooking {
                course_id: course_id.to_string(),
                student_id: student_id.to_string(),
                seat_label: seat,
                booked_at: applied_at,
                active: true,
            };
            let becomes_full = self.seat_maps.free_count(course_id) == 1;

            let mut records = vec![Self::record(
                RegistrationEventType::SeatBooked,
                course_id,
                Some(student_id),
                Some(seat),
                json!({ "source": "apply" }),
            )];
            if becomes_full {
                records.push(Self::record(
                    RegistrationEventType::BookingStatusChanged,
                    course_id,
                    None,
                    None,
                    json!({
                        "from": BookingStatus::Open.as_str(),
                        "to": BookingStatus::WaitlistOnly.as_str(),
                    }),
                ));
            }

            let mut txn = CourseTxn::new(course_id, runtime.seats.version);
            txn.push(TxnOp::InsertBooking(booking.clone()));
            if becomes_full {
                txn.push(TxnOp::SetBookingStatus {
                    status: BookingStatus::WaitlistOnly,
                    opened_at: runtime.seats.booking_opens_at,
                });
            }
            for record in &records {
                txn.push(TxnOp::AppendEvent(record.clone()));
            }
            self.store.commit(txn).await?;

            self.seat_maps.occupy(course_id, &seat, student_id)?;
            self.update_seats(course_id, |seats| {
                seats.version += 1;
                if becomes_full {
                    seats.booking_status = BookingStatus::WaitlistOnly;
                }
            });
            self.publish_records(&records);

            info!(student_id, course_id, seat = %seat, "student enrolled");
            Ok(ApplyOutcome::Enrolled {
                seat_label: seat,
                composite_score: breakdown.composite,
            })
        } else {
            let entry = WaitlistEntry {
                course_id: course_id.to_string(),
                student_id: student_id.to_string(),
                factors: breakdown.factors,
                composite_score: breakdown.composite,
                status: WaitlistStatus::Waiting,
                applied_at,
                preferred_seat,
            };

            let record = Self::record(
                RegistrationEventType::WaitlistUpdated,
                course_id,
                Some(student_id),
                None,
                json!({
                    "action": "added",
                    "waitlistSize": self.waitlists.len(course_id) + 1,
                }),
            );

            let mut txn = CourseTxn::new(course_id, runtime.seats.version);
            txn.push(TxnOp::InsertWaitlistEntry(entry.clone()));
            txn.push(TxnOp::AppendEvent(record.clone()));
            self.store.commit(txn).await?;

            let position = self.waitlists.insert(entry)?;
            self.update_seats(course_id, |seats| seats.version += 1);
            self.publish_records(std::slice::from_ref(&record));

            debug!(student_id, course_id, position, "student waitlisted");
            Ok(ApplyOutcome::Waitlisted {
                composite_score: breakdown.composite,
                position,
            })
        }
    }

    // ========================================================================
    // book_specific_seat
    // ========================================================================

    /// Books a named seat. Requires an OPEN window. Booking the last free
    /// seat transitions the course to WAITLIST_ONLY.
    #[instrument(skip(self), fields(student_id, course))]
    pub async fn book_specific_seat(
        &self,
        student_id: &str,
        course: &str,
        seat: SeatLabel,
    ) -> Result<SeatBooking> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        match self.book_inner(student_id, &course_id, seat).await {
            Err(RegistrationError::Conflict(reason)) => {
                warn!(%course_id, %reason, "conflict during booking, retrying once");
                self.resync(&course_id).await?;
                self.book_inner(student_id, &course_id, seat).await
            }
            result => result,
        }
    }

    async fn book_inner(
        &self,
        student_id: &str,
        course_id: &str,
        seat: SeatLabel,
    ) -> Result<SeatBooking> {
        self.require_student(student_id).await?;
        let runtime = self.runtime(course_id)?;

        match runtime.seats.booking_status {
            BookingStatus::Open => {}
            BookingStatus::WaitlistOnly => {
                return Err(RegistrationError::CapacityExceeded(course_id.to_string()))
            }
            _ => return Err(RegistrationError::BookingClosed(course_id.to_string())),
        }

        if !self.seat_maps.label_is_valid(course_id, &seat) {
            return Err(RegistrationError::InvalidSeatLabel(seat.to_string()));
        }
        if self.seat_maps.occupant_seat(course_id, student_id).is_some() {
            return Err(RegistrationError::AlreadyEnrolled {
                student_id: student_id.to_string(),
                course_id: course_id.to_string(),
            });
        }
        if !self.seat_maps.seat_is_free(course_id, &seat) {
            return Err(RegistrationError::SeatTaken { seat });
        }

        // A waitlisted student taking a seat directly leaves the waitlist in
        // the same transaction; they may never hold both.
        let was_waitlisted = self.waitlists.rank_of(course_id, student_id).is_some();
        let becomes_full = self.seat_maps.free_count(course_id) == 1;

        let booking = SeatBooking {
            course_id: course_id.to_string(),
            student_id: student_id.to_string(),
            seat_label: seat,
            booked_at: Utc::now(),
            active: true,
        };

        let mut records = vec![Self::record(
            RegistrationEventType::SeatBooked,
            course_id,
            Some(student_id),
            Some(seat),
            json!({ "source": "booking" }),
        )];
        if was_waitlisted {
            records.push(Self::record(
                RegistrationEventType::WaitlistUpdated,
                course_id,
                Some(student_id),
                None,
                json!({
                    "action": "removed",
                    "waitlistSize": self.waitlists.len(course_id).saturating_sub(1),
                }),
            ));
        }
        if becomes_full {
            records.push(Self::record(
                RegistrationEventType::BookingStatusChanged,
                course_id,
                None,
                None,
                json!({
                    "from": BookingStatus::Open.as_str(),
                    "to": BookingStatus::WaitlistOnly.as_str(),
                }),
            ));
        }

        let mut txn = CourseTxn::new(course_id, runtime.seats.version);
        txn.push(TxnOp::InsertBooking(booking.clone()));
        if was_waitlisted {
            txn.push(TxnOp::SetWaitlistStatus {
                student_id: student_id.to_string(),
                status: WaitlistStatus::Cancelled,
            });
        }
        if becomes_full {
            txn.push(TxnOp::SetBookingStatus {
                status: BookingStatus::WaitlistOnly,
                opened_at: runtime.seats.booking_opens_at,
            });
        }
        for record in &records {
            txn.push(TxnOp::AppendEvent(record.clone()));
        }
        self.store.commit(txn).await?;

        self.seat_maps.occupy(course_id, &seat, student_id)?;
        if was_waitlisted {
            self.waitlists.remove(course_id, student_id);
        }
        self.update_seats(course_id, |seats| {
            seats.version += 1;
            if becomes_full {
                seats.booking_status = BookingStatus::WaitlistOnly;
            }
        });
        self.publish_records(&records);

        info!(student_id, course_id, seat = %seat, "seat booked");
        Ok(booking)
    }

    // ========================================================================
    // drop + auto-fill
    // ========================================================================

    /// Releases a student's seat and promotes waitlisted students into the
    /// vacancies. Idempotent: dropping without an active booking is a no-op
    /// that emits nothing.
    #[instrument(skip(self), fields(student_id, course))]
    pub async fn drop_enrollment(&self, student_id: &str, course: &str) -> Result<DropOutcome> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        match self.drop_inner(student_id, &course_id).await {
            Err(RegistrationError::Conflict(reason)) => {
                warn!(%course_id, %reason, "conflict during drop, retrying once");
                self.resync(&course_id).await?;
                self.drop_inner(student_id, &course_id).await
            }
            result => result,
        }
    }

    async fn drop_inner(&self, student_id: &str, course_id: &str) -> Result<DropOutcome> {
        let runtime = self.runtime(course_id)?;

        if !runtime.seats.booking_status.accepts_drops() {
            return Err(RegistrationError::BookingClosed(course_id.to_string()));
        }

        let seat = match self.seat_maps.occupant_seat(course_id, student_id) {
            Some(seat) => seat,
            None => {
                debug!(student_id, course_id, "drop without active booking, no-op");
                return Ok(DropOutcome {
                    released_seat: None,
                    auto_enrolled: Vec::new(),
                });
            }
        };

        // Plan auto-fill against the post-release free set. Bounded by the
        // number of free seats at invocation time.
        let spr = runtime.seats.seats_per_row;
        let mut free_cells: BTreeSet<usize> = self
            .free_cell_indices(course_id, spr)
            .into_iter()
            .collect();
        free_cells.insert(seat.cell_index(spr));

        let candidates = self.waitlists.top_k(course_id, free_cells.len());
        let mut promotions: Vec<(WaitlistEntry, SeatLabel)> = Vec::new();
        for entry in candidates {
            let cell = entry
                .preferred_seat
                .map(|s| s.cell_index(spr))
                .filter(|cell| free_cells.contains(cell))
                .or_else(|| free_cells.iter().next().copied());
            let cell = match cell {
                Some(c) => c,
                None => break,
            };
            free_cells.remove(&cell);
            promotions.push((entry, SeatLabel::from_cell_index(cell, spr)));
        }

        let released_metadata = match promotions
            .iter()
            .find(|(_, promoted_seat)| *promoted_seat == seat)
        {
            Some((entry, _)) => json!({ "newOccupantId": entry.student_id }),
            None => json!({}),
        };
        let mut records = vec![Self::record(
            RegistrationEventType::SeatReleased,
            course_id,
            Some(student_id),
            Some(seat),
            released_metadata,
        )];
        for (entry, promoted_seat) in &promotions {
            records.push(Self::record(
                RegistrationEventType::StudentAutoEnrolled,
                course_id,
                Some(&entry.student_id),
                Some(*promoted_seat),
                json!({ "compositeScore": entry.composite_score }),
            ));
        }

        // A WAITLIST_ONLY course reopens only when auto-fill leaves a seat
        // free. A STARTED course never changes status on drop.
        let reopens = runtime.seats.booking_status == BookingStatus::WaitlistOnly
            && !free_cells.is_empty();
        if reopens {
            records.push(Self::record(
                RegistrationEventType::BookingStatusChanged,
                course_id,
                None,
                None,
                json!({
                    "from": BookingStatus::WaitlistOnly.as_str(),
                    "to": BookingStatus::Open.as_str(),
                }),
            ));
        }

        let booked_at = Utc::now();
        let mut txn = CourseTxn::new(course_id, runtime.seats.version);
        txn.push(TxnOp::DeactivateBooking {
            student_id: student_id.to_string(),
        });
        for (entry, promoted_seat) in &promotions {
            txn.push(TxnOp::SetWaitlistStatus {
                student_id: entry.student_id.clone(),
                status: WaitlistStatus::Allocated,
            });
            txn.push(TxnOp::InsertBooking(SeatBooking {
                course_id: course_id.to_string(),
                student_id: entry.student_id.clone(),
                seat_label: *promoted_seat,
                booked_at,
                active: true,
            }));
        }
        if reopens {
            txn.push(TxnOp::SetBookingStatus {
                status: BookingStatus::Open,
                opened_at: runtime.seats.booking_opens_at,
            });
        }
        for record in &records {
            txn.push(TxnOp::AppendEvent(record.clone()));
        }
        self.store.commit(txn).await?;

        self.seat_maps.release(course_id, &seat);
        let mut auto_enrolled = Vec::new();
        for (entry, promoted_seat) in &promotions {
            self.waitlists.remove(course_id, &entry.student_id);
            self.seat_maps
                .occupy(course_id, promoted_seat, &entry.student_id)?;
            auto_enrolled.push(AutoEnrollment {
                student_id: entry.student_id.clone(),
                seat_label: *promoted_seat,
            });
        }
        self.update_seats(course_id, |seats| {
            seats.version += 1;
            if reopens {
                seats.booking_status = BookingStatus::Open;
            }
        });
        self.publish_records(&records);

        info!(
            student_id,
            course_id,
            seat = %seat,
            promoted = auto_enrolled.len(),
            "seat dropped"
        );
        Ok(DropOutcome {
            released_seat: Some(seat),
            auto_enrolled,
        })
    }

    fn free_cell_indices(&self, course_id: &str, seats_per_row: u32) -> Vec<usize> {
        match self.seat_maps.state(course_id) {
            Some(state) => state
                .seats
                .iter()
                .filter(|seat| !seat.occupied)
                .map(|seat| seat.label.cell_index(seats_per_row))
                .collect(),
            None => Vec::new(),
        }
    }

    // ========================================================================
    // Booking window transitions
    // ========================================================================

    /// CLOSED -> OPEN. Records the opening time used for time-decay scoring.
    #[instrument(skip(self), fields(course))]
    pub async fn open_booking(&self, course: &str) -> Result<()> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        match self.transition_inner(&course_id, BookingStatus::Open).await {
            Err(RegistrationError::Conflict(reason)) => {
                warn!(%course_id, %reason, "conflict during open, retrying once");
                self.resync(&course_id).await?;
                self.transition_inner(&course_id, BookingStatus::Open).await
            }
            result => result,
        }
    }

    /// OPEN/WAITLIST_ONLY -> CLOSED, followed by the final allocation for
    /// the course and expiry of any entries still waiting.
    #[instrument(skip(self), fields(course))]
    pub async fn close_booking(&self, course: &str) -> Result<AllocationReport> {
        let course_id = self.resolve_course_id(course).await?;
        {
            let _guard = self.lock_course(&course_id).await?;
            match self
                .transition_inner(&course_id, BookingStatus::Closed)
                .await
            {
                Err(RegistrationError::Conflict(reason)) => {
                    warn!(%course_id, %reason, "conflict during close, retrying once");
                    self.resync(&course_id).await?;
                    self.transition_inner(&course_id, BookingStatus::Closed)
                        .await?;
                }
                Err(err) => return Err(err),
                Ok(()) => {}
            }
        }

        let targets = vec![course_id.clone()];
        let report = self.run_allocation(Some(&targets)).await?;
        self.expire_waitlist(&course_id).await?;
        Ok(report)
    }

    async fn transition_inner(&self, course_id: &str, target: BookingStatus) -> Result<()> {
        let runtime = self.runtime(course_id)?;
        let current = runtime.seats.booking_status;

        let allowed = match target {
            BookingStatus::Open => match current {
                BookingStatus::Closed => true,
                BookingStatus::Open | BookingStatus::WaitlistOnly => {
                    return Err(RegistrationError::BookingAlreadyOpen(course_id.to_string()))
                }
                _ => false,
            },
            BookingStatus::Closed => {
                matches!(current, BookingStatus::Open | BookingStatus::WaitlistOnly)
            }
            BookingStatus::Started => matches!(
                current,
                BookingStatus::Closed | BookingStatus::Open | BookingStatus::WaitlistOnly
            ),
            BookingStatus::Completed => matches!(current, BookingStatus::Started),
            BookingStatus::WaitlistOnly => false,
        };
        if !allowed {
            return Err(RegistrationError::BookingClosed(course_id.to_string()));
        }

        let opened_at = if target == BookingStatus::Open {
            Some(Utc::now())
        } else {
            runtime.seats.booking_opens_at
        };

        let record = Self::record(
            RegistrationEventType::BookingStatusChanged,
            course_id,
            None,
            None,
            json!({ "from": current.as_str(), "to": target.as_str() }),
        );
        let mut txn = CourseTxn::new(course_id, runtime.seats.version);
        txn.push(TxnOp::SetBookingStatus {
            status: target,
            opened_at,
        });
        txn.push(TxnOp::AppendEvent(record.clone()));
        self.store.commit(txn).await?;

        self.update_seats(course_id, |seats| {
            seats.version += 1;
            seats.booking_status = target;
            seats.booking_opens_at = opened_at;
        });
        self.publish_records(std::slice::from_ref(&record));

        info!(course_id, from = current.as_str(), to = target.as_str(), "booking status changed");
        Ok(())
    }

    /// Marks a course as started. Drops still work (with auto-fill); new
    /// applications no longer do.
    pub async fn start_course(&self, course: &str) -> Result<()> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        self.transition_inner(&course_id, BookingStatus::Started)
            .await
    }

    /// Marks a started course as completed. Terminal.
    pub async fn complete_course(&self, course: &str) -> Result<()> {
        let course_id = self.resolve_course_id(course).await?;
        let _guard = self.lock_course(&course_id).await?;
        self.transition_inner(&course_id, BookingStatus::Completed)
            .await
    }

    /// Expires every entry still waiting on a course. Runs after the final
    /// close-time allocation.
    async fn expire_waitlist(&self, course_id: &str) -> Result<()> {
        let _guard = self.lock_course(course_id).await?;
        let leftovers = self.waitlists.snapshot(course_id);
        if leftovers.is_empty() {
            return Ok(());
        }
        let runtime = self.runtime(course_id)?;

        let record = Self::record(
            RegistrationEventType::WaitlistUpdated,
            course_id,
            None,
            None,
            json!({ "action": "expired", "count": leftovers.len() }),
        );
        let mut txn = CourseTxn::new(course_id, runtime.seats.version);
        for entry in &leftovers {
            txn.push(TxnOp::SetWaitlistStatus {
                student_id: entry.student_id.clone(),
                status: WaitlistStatus::Expired,
            });
        }
        txn.push(TxnOp::AppendEvent(record.clone()));
        self.store.commit(txn).await?;

        self.waitlists.drain(course_id);
        self.update_seats(course_id, |seats| seats.version += 1);
        self.publish_records(std::slice::from_ref(&record));

        info!(course_id, expired = leftovers.len(), "waitlist expired on close");
        Ok(())
    }

    // ========================================================================
    // Batch allocation
    // ========================================================================

    /// Runs the configured allocation strategy over the given courses (or
    /// all known courses).
    pub async fn run_allocation(&self, course_ids: Option<&[String]>) -> Result<AllocationReport> {
        self.run_allocation_cancellable(course_ids, &CancellationToken::new())
            .await
    }

    /// Cancellable variant: the token is honored at course boundaries;
    /// per-course allocations that already committed are kept.
    #[instrument(skip(self, cancel))]
    pub async fn run_allocation_cancellable(
        &self,
        course_ids: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<AllocationReport> {
        let mut targets: Vec<String> = match course_ids {
            Some(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    resolved.push(self.resolve_course_id(id).await?);
                }
                resolved
            }
            None => self.runtimes.iter().map(|e| e.key().clone()).collect(),
        };
        targets.sort();
        targets.dedup();

        // Lock the targets plus every course a candidate also waits on (the
        // preference cascade mutates those too). The involved set is
        // recomputed after locking; if membership moved in the gap, release
        // and retry.
        let mut involved = self.involved_courses(&targets);
        let _guards = loop {
            let guards = self.lock_courses(&involved).await?;
            let check = self.involved_courses(&targets);
            if check == involved {
                break guards;
            }
            drop(guards);
            involved = check;
        };

        // Snapshot under the locks.
        let mut snapshots = Vec::new();
        let mut students: BTreeSet<String> = BTreeSet::new();
        for course_id in &targets {
            let runtime = self.runtime(course_id)?;
            if matches!(
                runtime.seats.booking_status,
                BookingStatus::Started | BookingStatus::Completed
            ) {
                continue;
            }
            let entries = self.waitlists.snapshot(course_id);
            if entries.is_empty() {
                continue;
            }
            for entry in &entries {
                students.insert(entry.student_id.clone());
            }
            snapshots.push(CourseSnapshot {
                course_id: course_id.clone(),
                free_seats: self.seat_maps.free_count(course_id),
                entries,
            });
        }

        let mut preferences = HashMap::new();
        for student_id in &students {
            let mut prefs = self.store.preferences_for(student_id).await?;
            prefs.sort_by_key(|p| p.priority);
            preferences.insert(student_id.clone(), prefs);
        }

        let input = AllocationInput {
            courses: snapshots,
            preferences,
        };
        let outcome = allocation::run(self.config.allocation_strategy, &input);
        debug!(
            strategy = %self.config.allocation_strategy,
            awards = outcome.awards.len(),
            "allocation computed"
        );

        let plans = self.build_allocation_plans(&input, &outcome)?;

        // Commit course by course in sorted id order; the token is honored
        // between courses and committed allocations stay.
        let mut report = AllocationReport::default();
        for (course_id, plan) in plans {
            if cancel.is_cancelled() {
                warn!(course_id, "allocation cancelled at course boundary");
                report.cancelled = true;
                break;
            }
            self.commit_allocation_plan(&course_id, plan, &mut report)
                .await?;
        }
        Ok(report)
    }

    /// Courses whose locks an allocation over `targets` needs: the targets
    /// themselves plus every course a candidate student also waits on.
    fn involved_courses(&self, targets: &[String]) -> Vec<String> {
        let mut involved: BTreeSet<String> = targets.iter().cloned().collect();
        for course_id in targets {
            for entry in self.waitlists.snapshot(course_id) {
                for other in self.waitlists.courses_for_student(&entry.student_id) {
                    involved.insert(other);
                }
            }
        }
        involved.into_iter().collect()
    }

    fn build_allocation_plans(
        &self,
        input: &AllocationInput,
        outcome: &allocation::AllocationOutcome,
    ) -> Result<BTreeMap<String, CoursePlan>> {
        let awarded_pairs: HashSet<(&str, &str)> = outcome
            .awards
            .iter()
            .map(|a| (a.course_id.as_str(), a.student_id.as_str()))
            .collect();

        let mut plans: BTreeMap<String, CoursePlan> = BTreeMap::new();
        let mut free_cells: HashMap<String, BTreeSet<usize>> = HashMap::new();
        let booked_at = Utc::now();

        for award in &outcome.awards {
            let course_id = award.course_id.as_str();
            let runtime = self.runtime(course_id)?;
            let spr = runtime.seats.seats_per_row;
            let free = free_cells.entry(course_id.to_string()).or_insert_with(|| {
                self.free_cell_indices(course_id, spr).into_iter().collect()
            });

            let snapshot = input
                .courses
                .iter()
                .find(|c| c.course_id == course_id)
                .ok_or_else(|| {
                    RegistrationError::Internal(anyhow::anyhow!(
                        "award for course missing from snapshot: {course_id}"
                    ))
                })?;
            let entry = snapshot
                .entries
                .iter()
                .find(|e| e.student_id == award.student_id)
                .ok_or_else(|| {
                    RegistrationError::Internal(anyhow::anyhow!(
                        "award for student missing from waitlist: {}",
                        award.student_id
                    ))
                })?;

            let cell = entry
                .preferred_seat
                .map(|s| s.cell_index(spr))
                .filter(|cell| free.contains(cell))
                .or_else(|| free.iter().next().copied());
            let cell = match cell {
                Some(c) => c,
                None => {
                    // Free seats ran out (a strategy awarded beyond the
                    // snapshot); skip rather than overbook.
                    warn!(course_id, student_id = %award.student_id, "no free seat for award");
                    continue;
                }
            };
            free.remove(&cell);
            let seat = SeatLabel::from_cell_index(cell, spr);

            let plan = plans.entry(course_id.to_string()).or_default();
            plan.bookings.push(SeatBooking {
                course_id: course_id.to_string(),
                student_id: award.student_id.clone(),
                seat_label: seat,
                booked_at,
                active: true,
            });
            plan.records.push(Self::record(
                RegistrationEventType::SeatBooked,
                course_id,
                Some(&award.student_id),
                Some(seat),
                json!({ "source": "allocation", "compositeScore": entry.composite_score }),
            ));

            // Preference cascade: the student has this outcome or better, so
            // entries on strictly lower-priority courses are cancelled.
            for other in self.waitlists.courses_for_student(&award.student_id) {
                if other == course_id
                    || awarded_pairs.contains(&(other.as_str(), award.student_id.as_str()))
                {
                    continue;
                }
                if allocation::course_rank(input, &award.student_id, &other)
                    > allocation::course_rank(input, &award.student_id, course_id)
                {
                    let other_plan = plans.entry(other.clone()).or_default();
                    other_plan.cancelled_students.push(award.student_id.clone());
                    other_plan.records.push(Self::record(
                        RegistrationEventType::WaitlistUpdated,
                        &other,
                        Some(&award.student_id),
                        None,
                        json!({ "action": "cancelled", "reason": "higherPriorityEnrollment" }),
                    ));
                }
            }
        }

        // Status transitions for courses filled by this run.
        for (course_id, plan) in plans.iter_mut() {
            let runtime = self.runtime(course_id)?;
            if runtime.seats.booking_status != BookingStatus::Open {
                continue;
            }
            let free_after = match free_cells.get(course_id) {
                Some(free) => free.len(),
                None => continue,
            };
            if free_after == 0 && !plan.bookings.is_empty() {
                plan.new_status = Some(BookingStatus::WaitlistOnly);
                plan.records.push(Self::record(
                    RegistrationEventType::BookingStatusChanged,
                    course_id,
                    None,
                    None,
                    json!({
                        "from": BookingStatus::Open.as_str(),
                        "to": BookingStatus::WaitlistOnly.as_str(),
                    }),
                ));
            }
        }

        Ok(plans)
    }

    async fn commit_allocation_plan(
        &self,
        course_id: &str,
        plan: CoursePlan,
        report: &mut AllocationReport,
    ) -> Result<()> {
        let runtime = self.runtime(course_id)?;
        let build = |version: i64| {
            let mut txn = CourseTxn::new(course_id, version);
            for booking in &plan.bookings {
                txn.push(TxnOp::SetWaitlistStatus {
                    student_id: booking.student_id.clone(),
                    status: WaitlistStatus::Allocated,
                });
                txn.push(TxnOp::InsertBooking(booking.clone()));
            }
            for student_id in &plan.cancelled_students {
                txn.push(TxnOp::SetWaitlistStatus {
                    student_id: student_id.clone(),
                    status: WaitlistStatus::Cancelled,
                });
            }
            if let Some(status) = plan.new_status {
                txn.push(TxnOp::SetBookingStatus {
                    status,
                    opened_at: runtime.seats.booking_opens_at,
                });
            }
            for record in &plan.records {
                txn.push(TxnOp::AppendEvent(record.clone()));
            }
            txn
        };

        match self.store.commit(build(runtime.seats.version)).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                warn!(course_id, %reason, "conflict committing allocation, retrying once");
                self.resync(course_id).await?;
                let version = self.runtime(course_id)?.seats.version;
                self.store.commit(build(version)).await?;
            }
            Err(err) => return Err(err.into()),
        }

        for booking in &plan.bookings {
            self.waitlists.remove(course_id, &booking.student_id);
            self.seat_maps
                .occupy(course_id, &booking.seat_label, &booking.student_id)?;
            report.awards.push(AwardedSeat {
                course_id: course_id.to_string(),
                student_id: booking.student_id.clone(),
                seat_label: booking.seat_label,
            });
        }
        for student_id in &plan.cancelled_students {
            self.waitlists.remove(course_id, student_id);
        }
        let new_status = plan.new_status;
        self.update_seats(course_id, |seats| {
            seats.version += 1;
            if let Some(status) = new_status {
                seats.booking_status = status;
            }
        });
        self.publish_records(&plan.records);

        info!(
            course_id,
            awards = plan.bookings.len(),
            cancelled = plan.cancelled_students.len(),
            "allocation committed"
        );
        Ok(())
    }

    // ========================================================================
    // Preferences
    // ========================================================================

    /// Replaces a student's preference list en bloc; priorities must be
    /// dense 1..K.
    pub async fn replace_preferences(
        &self,
        student_id: &str,
        prefs: Vec<CoursePreference>,
    ) -> Result<()> {
        self.require_student(student_id).await?;
        validate_preferences(student_id, &prefs)?;
        for pref in &prefs {
            self.resolve_course_id(&pref.course_id).await?;
        }
        self.store.replace_preferences(student_id, &prefs).await?;
        debug!(student_id, count = prefs.len(), "preferences replaced");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list_courses(&self) -> Result<Vec<CourseAvailability>> {
        let mut rows: Vec<CourseAvailability> = self
            .runtimes
            .iter()
            .map(|entry| {
                let runtime = entry.value();
                let course_id = entry.key();
                CourseAvailability {
                    course: runtime.course.clone(),
                    booking_status: runtime.seats.booking_status,
                    total_seats: runtime.seats.total_seats,
                    occupied: self.seat_maps.occupied_count(course_id),
                    available: self.seat_maps.free_count(course_id),
                    waitlist_size: self.waitlists.len(course_id),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.course.code.cmp(&b.course.code));
        Ok(rows)
    }

    pub async fn classroom_state(&self, course: &str) -> Result<ClassroomView> {
        let course_id = self.resolve_course_id(course).await?;
        let runtime = self.runtime(&course_id)?;
        let state = self
            .seat_maps
            .state(&course_id)
            .ok_or_else(|| RegistrationError::CourseNotFound(course_id.clone()))?;
        Ok(ClassroomView {
            course_id,
            booking_status: runtime.seats.booking_status,
            state,
        })
    }

    pub async fn waitlist_top(&self, course: &str, limit: usize) -> Result<Vec<WaitlistEntryView>> {
        let course_id = self.resolve_course_id(course).await?;
        Ok(self
            .waitlists
            .top_k(&course_id, limit)
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| WaitlistEntryView {
                rank: idx + 1,
                student_id: entry.student_id,
                composite_score: entry.composite_score,
                factors: entry.factors,
                applied_at: entry.applied_at,
            })
            .collect())
    }

    pub async fn waitlist_rank(&self, course: &str, student_id: &str) -> Result<Option<usize>> {
        let course_id = self.resolve_course_id(course).await?;
        Ok(self.waitlists.rank_of(&course_id, student_id))
    }

    pub async fn student_status(&self, student_id: &str) -> Result<StudentStatusView> {
        self.require_student(student_id).await?;

        let enrollments = self
            .store
            .active_bookings_for_student(student_id)
            .await?
            .into_iter()
            .map(|booking| {
                let (code, name) = self
                    .runtimes
                    .get(&booking.course_id)
                    .map(|rt| (rt.course.code.clone(), rt.course.name.clone()))
                    .unwrap_or_default();
                EnrollmentView {
                    course_id: booking.course_id,
                    course_code: code,
                    course_name: name,
                    seat_label: booking.seat_label,
                    booked_at: booking.booked_at,
                }
            })
            .collect();

        let mut waitlists = Vec::new();
        for course_id in self.waitlists.courses_for_student(student_id) {
            if let Some(rank) = self.waitlists.rank_of(&course_id, student_id) {
                let score = self
                    .waitlists
                    .snapshot(&course_id)
                    .into_iter()
                    .find(|e| e.student_id == student_id)
                    .map(|e| e.composite_score)
                    .unwrap_or_default();
                waitlists.push(WaitlistPositionView {
                    course_id,
                    rank,
                    composite_score: score,
                });
            }
        }

        let mut preferences = self.store.preferences_for(student_id).await?;
        preferences.sort_by_key(|p| p.priority);

        Ok(StudentStatusView {
            student_id: student_id.to_string(),
            enrollments,
            waitlists,
            preferences,
        })
    }

    pub async fn student_preferences(&self, student_id: &str) -> Result<Vec<PreferredCourseView>> {
        self.require_student(student_id).await?;
        let mut prefs = self.store.preferences_for(student_id).await?;
        prefs.sort_by_key(|p| p.priority);

        let mut views = Vec::with_capacity(prefs.len());
        for pref in prefs {
            let course_id = self.resolve_course_id(&pref.course_id).await?;
            let runtime = self.runtime(&course_id)?;
            views.push(PreferredCourseView {
                course: runtime.course,
                priority: pref.priority,
                match_reason: pref.match_reason,
            });
        }
        Ok(views)
    }

    async fn require_student(&self, student_id: &str) -> Result<Student> {
        self.store
            .get_student(student_id)
            .await?
            .ok_or_else(|| RegistrationError::StudentNotFound(student_id.to_string()))
    }
}
