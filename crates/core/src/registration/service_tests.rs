use std::sync::Arc;

use serde_json::json;

use crate::config::EngineConfig;
use crate::domain::{
    BookingStatus, CoursePreference, RegistrationError, RegistrationEventType, SeatLabel,
    WaitlistStatus,
};
use crate::ports::RegistrationStore;
use crate::registration::{ApplyOutcome, RegistrationService};
use crate::testing::{fixtures, InMemoryStore};

fn label(s: &str) -> SeatLabel {
    s.parse().expect("valid seat label")
}

/// Builds a service over an in-memory store with the given courses
/// (id, code, rows, seats_per_row) and students (id, gpa, year).
async fn setup(
    courses: &[(&str, &str, u32, u32)],
    students: &[(&str, f64, u8)],
) -> (Arc<RegistrationService>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    for (id, code, rows, seats_per_row) in courses {
        store
            .upsert_course(&fixtures::course(id, code))
            .await
            .expect("course");
        store
            .upsert_seat_config(&fixtures::seat_config(id, *rows, *seats_per_row))
            .await
            .expect("seat config");
    }
    for (id, gpa, year) in students {
        store
            .upsert_student(&fixtures::student(id, *gpa, *year))
            .await
            .expect("student");
    }

    let service = RegistrationService::new(store.clone(), EngineConfig::default())
        .expect("valid config");
    service.load_courses().await.expect("load");
    (Arc::new(service), store)
}

fn event_count(store: &InMemoryStore, event_type: RegistrationEventType) -> usize {
    store
        .event_log()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

// ============================================================================
// Scenario: capacity 2, three applicants
// ============================================================================

#[tokio::test]
async fn allocation_fills_two_seats_best_scores_first() {
    let (service, store) = setup(
        &[("x", "CS101", 1, 2)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2), ("carol", 3.0, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();

    for student in ["alice", "bob", "carol"] {
        let outcome = service.apply(student, "x", None, false).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Waitlisted { .. }));
    }

    let targets = vec!["x".to_string()];
    let report = service.run_allocation(Some(&targets)).await.unwrap();
    assert_eq!(report.awards.len(), 2);
    assert!(!report.cancelled);
    assert_eq!(report.awards[0].student_id, "alice");
    assert_eq!(report.awards[0].seat_label, label("A1"));
    assert_eq!(report.awards[1].student_id, "bob");
    assert_eq!(report.awards[1].seat_label, label("A2"));

    assert_eq!(service.waitlist_rank("x", "carol").await.unwrap(), Some(1));
    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.state.occupied, 2);
    assert_eq!(classroom.state.available, 0);
    assert_eq!(event_count(&store, RegistrationEventType::SeatBooked), 2);
}

// ============================================================================
// Scenario: auto-fill on drop
// ============================================================================

#[tokio::test]
async fn drop_promotes_top_waitlisted_student() {
    let (service, store) = setup(
        &[("x", "CS101", 1, 2)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2), ("carol", 3.0, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();
    for student in ["alice", "bob", "carol"] {
        service.apply(student, "x", None, false).await.unwrap();
    }
    let targets = vec!["x".to_string()];
    service.run_allocation(Some(&targets)).await.unwrap();

    let mut rx = service.events().subscribe("x");
    let outcome = service.drop_enrollment("bob", "x").await.unwrap();

    assert_eq!(outcome.released_seat, Some(label("A2")));
    assert_eq!(outcome.auto_enrolled.len(), 1);
    assert_eq!(outcome.auto_enrolled[0].student_id, "carol");
    assert_eq!(outcome.auto_enrolled[0].seat_label, label("A2"));

    // SEAT_RELEASED first (carrying the replacement occupant), then the
    // promotion itself.
    let released = rx.recv().await.unwrap();
    assert_eq!(released.event_type, RegistrationEventType::SeatReleased);
    assert_eq!(released.payload["seatLabel"], json!("A2"));
    assert_eq!(released.payload["newOccupantId"], json!("carol"));
    let promoted = rx.recv().await.unwrap();
    assert_eq!(
        promoted.event_type,
        RegistrationEventType::StudentAutoEnrolled
    );
    assert_eq!(promoted.payload["studentId"], json!("carol"));

    assert_eq!(service.waitlist_rank("x", "carol").await.unwrap(), None);
    let status = service.student_status("carol").await.unwrap();
    assert_eq!(status.enrollments.len(), 1);
    assert_eq!(status.enrollments[0].seat_label, label("A2"));
    assert_eq!(
        event_count(&store, RegistrationEventType::StudentAutoEnrolled),
        1
    );
}

// ============================================================================
// Scenario: tie-break by application time
// ============================================================================

#[tokio::test]
async fn identical_scores_rank_earlier_applicant_first() {
    // Booking never opened: the time factor is 1.0 for both, so composites
    // tie exactly and the application timestamp decides.
    let (service, _store) = setup(
        &[("x", "CS101", 1, 1)],
        &[("zed", 3.5, 2), ("amy", 3.5, 2)],
    )
    .await;

    service.apply("zed", "x", None, false).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    service.apply("amy", "x", None, false).await.unwrap();

    assert_eq!(service.waitlist_rank("x", "zed").await.unwrap(), Some(1));
    assert_eq!(service.waitlist_rank("x", "amy").await.unwrap(), Some(2));
}

// ============================================================================
// Scenario: preference cascade on allocation
// ============================================================================

#[tokio::test]
async fn allocation_cancels_lower_priority_waitlist_entries() {
    let (service, store) = setup(
        &[("x", "CS101", 1, 1), ("y", "CS102", 1, 1)],
        &[("sam", 3.5, 2)],
    )
    .await;
    service
        .replace_preferences(
            "sam",
            vec![
                CoursePreference {
                    student_id: "sam".to_string(),
                    course_id: "x".to_string(),
                    priority: 1,
                    match_reason: "best fit".to_string(),
                },
                CoursePreference {
                    student_id: "sam".to_string(),
                    course_id: "y".to_string(),
                    priority: 2,
                    match_reason: "backup".to_string(),
                },
            ],
        )
        .await
        .unwrap();

    service.apply("sam", "x", None, false).await.unwrap();
    service.apply("sam", "y", None, false).await.unwrap();

    let report = service.run_allocation(None).await.unwrap();
    assert_eq!(report.awards.len(), 1);
    assert_eq!(report.awards[0].course_id, "x");

    assert_eq!(service.waitlist_rank("x", "sam").await.unwrap(), None);
    assert_eq!(service.waitlist_rank("y", "sam").await.unwrap(), None);

    let cancelled = store
        .waitlist_rows()
        .into_iter()
        .find(|e| e.course_id == "y")
        .unwrap();
    assert_eq!(cancelled.status, WaitlistStatus::Cancelled);

    let waitlist_events: Vec<_> = store
        .event_log()
        .into_iter()
        .filter(|e| {
            e.event_type == RegistrationEventType::WaitlistUpdated && e.course_id == "y"
        })
        .collect();
    assert!(!waitlist_events.is_empty());
}

// ============================================================================
// Scenario: booking state transitions
// ============================================================================

#[tokio::test]
async fn full_course_goes_waitlist_only_and_reopens_after_drop() {
    let (service, store) = setup(
        &[("x", "CS101", 1, 1)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();

    service
        .book_specific_seat("alice", "x", label("A1"))
        .await
        .unwrap();
    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.booking_status, BookingStatus::WaitlistOnly);
    assert!(event_count(&store, RegistrationEventType::BookingStatusChanged) >= 2);

    // Full: applications fall through to the waitlist even with
    // auto-register set.
    let outcome = service.apply("bob", "x", None, true).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Waitlisted { position: 1, .. }));

    // Drop: bob is auto-enrolled, the course is full again and stays
    // WAITLIST_ONLY.
    let outcome = service.drop_enrollment("alice", "x").await.unwrap();
    assert_eq!(outcome.auto_enrolled.len(), 1);
    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.booking_status, BookingStatus::WaitlistOnly);

    // Drop with nobody waiting: the vacancy survives and booking reopens.
    service.drop_enrollment("bob", "x").await.unwrap();
    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.booking_status, BookingStatus::Open);
    assert_eq!(classroom.state.available, 1);
}

// ============================================================================
// Scenario: concurrent applies
// ============================================================================

#[tokio::test]
async fn concurrent_applies_never_oversubscribe() {
    let students: Vec<(String, f64, u8)> = (0..100)
        .map(|i| (format!("student-{i:03}"), 2.0 + (i as f64) * 0.02, 2))
        .collect();
    let student_refs: Vec<(&str, f64, u8)> = students
        .iter()
        .map(|(id, gpa, year)| (id.as_str(), *gpa, *year))
        .collect();
    let (service, store) = setup(&[("x", "CS101", 2, 5)], &student_refs).await;
    service.open_booking("x").await.unwrap();

    let mut handles = Vec::new();
    for (id, _, _) in &students {
        let service = Arc::clone(&service);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            service.apply(&id, "x", None, true).await
        }));
    }

    let mut enrolled = 0;
    let mut waitlisted = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ApplyOutcome::Enrolled { .. } => enrolled += 1,
            ApplyOutcome::Waitlisted { .. } => waitlisted += 1,
        }
    }
    assert_eq!(enrolled, 10);
    assert_eq!(waitlisted, 90);

    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.state.occupied, 10);
    assert_eq!(classroom.state.available, 0);
    assert_eq!(classroom.booking_status, BookingStatus::WaitlistOnly);

    // Each seat label booked exactly once.
    let mut booked_seats: Vec<String> = store
        .event_log()
        .iter()
        .filter(|e| e.event_type == RegistrationEventType::SeatBooked)
        .filter_map(|e| e.seat_label.map(|s| s.to_string()))
        .collect();
    booked_seats.sort();
    let before = booked_seats.len();
    booked_seats.dedup();
    assert_eq!(booked_seats.len(), before);
    assert_eq!(before, 10);

    // Waitlist order is the deterministic tie-broken order: composite
    // scores descend, and every rank matches its snapshot position.
    let waitlist = service.waitlist_top("x", 100).await.unwrap();
    assert_eq!(waitlist.len(), 90);
    for pair in waitlist.windows(2) {
        assert!(pair[0].composite_score >= pair[1].composite_score);
    }
    for row in &waitlist {
        assert_eq!(
            service.waitlist_rank("x", &row.student_id).await.unwrap(),
            Some(row.rank)
        );
    }
}

// ============================================================================
// Laws
// ============================================================================

#[tokio::test]
async fn second_drop_is_a_noop_without_events() {
    let (service, store) = setup(&[("x", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("x").await.unwrap();
    service.apply("alice", "x", None, true).await.unwrap();

    let first = service.drop_enrollment("alice", "x").await.unwrap();
    assert_eq!(first.released_seat, Some(label("A1")));
    assert_eq!(event_count(&store, RegistrationEventType::SeatReleased), 1);

    let second = service.drop_enrollment("alice", "x").await.unwrap();
    assert_eq!(second.released_seat, None);
    assert!(second.auto_enrolled.is_empty());
    assert_eq!(event_count(&store, RegistrationEventType::SeatReleased), 1);
}

#[tokio::test]
async fn apply_then_drop_round_trips_seatmap_and_waitlist() {
    let (service, _store) = setup(&[("x", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("x").await.unwrap();

    let before = service.classroom_state("x").await.unwrap();
    service.apply("alice", "x", None, true).await.unwrap();
    service.drop_enrollment("alice", "x").await.unwrap();
    let after = service.classroom_state("x").await.unwrap();

    assert_eq!(before.state.occupied, after.state.occupied);
    assert_eq!(before.state.available, after.state.available);
    for (a, b) in before.state.seats.iter().zip(after.state.seats.iter()) {
        assert_eq!(a.occupied, b.occupied);
        assert_eq!(a.student_id, b.student_id);
    }
    assert_eq!(service.waitlist_top("x", 10).await.unwrap().len(), 0);
}

#[tokio::test]
async fn conflict_is_retried_once_then_surfaced() {
    let (service, store) = setup(&[("x", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("x").await.unwrap();

    // One conflict: the retry succeeds.
    store.inject_conflicts(1);
    let outcome = service.apply("alice", "x", None, true).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Enrolled { .. }));

    // Persistent conflict: surfaced to the caller.
    store.inject_conflicts(2);
    let err = service.drop_enrollment("alice", "x").await.unwrap_err();
    assert!(matches!(err, RegistrationError::Conflict(_)));
}

// ============================================================================
// Validation and state-machine guards
// ============================================================================

#[tokio::test]
async fn apply_rejects_unknown_entities_and_missing_prereqs() {
    let (service, store) = setup(&[("x", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("x").await.unwrap();

    let err = service.apply("ghost", "x", None, true).await.unwrap_err();
    assert!(matches!(err, RegistrationError::StudentNotFound(_)));
    let err = service.apply("alice", "nope", None, true).await.unwrap_err();
    assert!(matches!(err, RegistrationError::CourseNotFound(_)));

    let mut advanced = fixtures::course("adv", "CS301");
    advanced.prerequisites = vec!["cs101".to_string()];
    store.upsert_course(&advanced).await.unwrap();
    store
        .upsert_seat_config(&fixtures::seat_config("adv", 1, 2))
        .await
        .unwrap();

    let err = service.apply("alice", "adv", None, true).await.unwrap_err();
    match err {
        RegistrationError::PrerequisiteMissing { missing, .. } => {
            assert_eq!(missing, vec!["cs101".to_string()]);
        }
        other => panic!("expected PrerequisiteMissing, got {other:?}"),
    }

    let mut ready = fixtures::student("ready", 3.2, 3);
    ready.completed_courses.insert("cs101".to_string());
    store.upsert_student(&ready).await.unwrap();
    service.apply("ready", "adv", None, false).await.unwrap();
}

#[tokio::test]
async fn duplicate_applications_are_rejected() {
    let (service, _store) = setup(&[("x", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("x").await.unwrap();

    service.apply("alice", "x", None, true).await.unwrap();
    let err = service.apply("alice", "x", None, true).await.unwrap_err();
    assert!(matches!(err, RegistrationError::AlreadyEnrolled { .. }));

    service.drop_enrollment("alice", "x").await.unwrap();
    service.apply("alice", "x", None, false).await.unwrap();
    let err = service.apply("alice", "x", None, false).await.unwrap_err();
    assert!(matches!(err, RegistrationError::AlreadyWaitlisted { .. }));
}

#[tokio::test]
async fn book_specific_seat_validates_state_and_seat() {
    let (service, _store) = setup(
        &[("x", "CS101", 1, 2)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2)],
    )
    .await;

    // Window still closed.
    let err = service
        .book_specific_seat("alice", "x", label("A1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::BookingClosed(_)));

    service.open_booking("x").await.unwrap();
    let err = service
        .book_specific_seat("alice", "x", label("B1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::InvalidSeatLabel(_)));

    service
        .book_specific_seat("alice", "x", label("A1"))
        .await
        .unwrap();
    let err = service
        .book_specific_seat("bob", "x", label("A1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistrationError::SeatTaken { .. }));
}

#[tokio::test]
async fn preferred_seat_falls_back_to_lowest_free() {
    let (service, _store) = setup(
        &[("x", "CS101", 1, 3)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();

    service
        .book_specific_seat("alice", "x", label("A2"))
        .await
        .unwrap();

    // Preferred seat A2 is taken: auto-register falls back to A1.
    let outcome = service
        .apply("bob", "x", Some(label("A2")), true)
        .await
        .unwrap();
    match outcome {
        ApplyOutcome::Enrolled { seat_label, .. } => assert_eq!(seat_label, label("A1")),
        other => panic!("expected enrollment, got {other:?}"),
    }
}

#[tokio::test]
async fn open_booking_twice_is_rejected() {
    let (service, _store) = setup(&[("x", "CS101", 1, 1)], &[]).await;
    service.open_booking("x").await.unwrap();
    let err = service.open_booking("x").await.unwrap_err();
    assert!(matches!(err, RegistrationError::BookingAlreadyOpen(_)));
}

#[tokio::test]
async fn close_booking_runs_final_allocation_and_expires_leftovers() {
    let (service, store) = setup(
        &[("x", "CS101", 1, 1)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();
    service.apply("alice", "x", None, false).await.unwrap();
    service.apply("bob", "x", None, false).await.unwrap();

    let report = service.close_booking("x").await.unwrap();
    assert_eq!(report.awards.len(), 1);
    assert_eq!(report.awards[0].student_id, "alice");

    let classroom = service.classroom_state("x").await.unwrap();
    assert_eq!(classroom.booking_status, BookingStatus::Closed);
    assert_eq!(classroom.state.occupied, 1);

    // bob's entry expired with the close.
    assert_eq!(service.waitlist_rank("x", "bob").await.unwrap(), None);
    let expired = store
        .waitlist_rows()
        .into_iter()
        .find(|e| e.student_id == "bob")
        .unwrap();
    assert_eq!(expired.status, WaitlistStatus::Expired);
}

#[tokio::test]
async fn human_course_codes_resolve_like_ids() {
    let (service, _store) = setup(&[("course-77", "CS101", 1, 2)], &[("alice", 3.9, 2)]).await;
    service.open_booking("CS101").await.unwrap();

    let outcome = service.apply("alice", "CS101", None, true).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Enrolled { .. }));
    let classroom = service.classroom_state("CS101").await.unwrap();
    assert_eq!(classroom.course_id, "course-77");
    assert_eq!(classroom.state.occupied, 1);
}

#[tokio::test]
async fn invalid_engine_config_is_fatal() {
    let store = Arc::new(InMemoryStore::new());
    let mut config = EngineConfig::default();
    config.score_weights.gpa = 0.9;
    let err = RegistrationService::new(store, config).unwrap_err();
    assert!(matches!(err, RegistrationError::ConfigurationInvalid(_)));
}

#[tokio::test]
async fn started_course_allows_drop_but_not_apply() {
    let (service, _store) = setup(
        &[("x", "CS101", 1, 2)],
        &[("alice", 3.9, 2), ("bob", 3.5, 2), ("carol", 3.0, 2)],
    )
    .await;
    service.open_booking("x").await.unwrap();
    service.apply("alice", "x", None, true).await.unwrap();
    service.apply("bob", "x", None, true).await.unwrap();
    service.close_booking("x").await.unwrap();
    service.start_course("x").await.unwrap();

    let err = service.apply("carol", "x", None, true).await.unwrap_err();
    assert!(matches!(err, RegistrationError::BookingClosed(_)));

    let outcome = service.drop_enrollment("alice", "x").await.unwrap();
    assert_eq!(outcome.released_seat, Some(label("A1")));

    service.complete_course("x").await.unwrap();
    let err = service.drop_enrollment("bob", "x").await.unwrap_err();
    assert!(matches!(err, RegistrationError::BookingClosed(_)));
}
