use chrono::Utc;
use tempfile::TempDir;

use enroll_core::testing::fixtures;
use enroll_core::{
    BookingStatus, CoursePreference, CourseTxn, RegistrationEvent, RegistrationEventType,
    RegistrationStore, SeatBooking, SeatLabel, StoreError, TxnOp, WaitlistEntry, WaitlistStatus,
};
use enroll_storage::{init_registration_db, SqliteRegistrationStore};

fn label(s: &str) -> SeatLabel {
    s.parse().expect("valid seat label")
}

/// Fresh store backed by a file database in a temp dir.
async fn setup() -> (SqliteRegistrationStore, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("registration.db");
    let pool = init_registration_db(db_path.to_str().expect("utf8 path"))
        .await
        .expect("init db");
    (SqliteRegistrationStore::new(pool), dir)
}

async fn seed_course(store: &SqliteRegistrationStore, course_id: &str, code: &str) {
    store
        .upsert_course(&fixtures::course(course_id, code))
        .await
        .expect("course");
    store
        .upsert_seat_config(&fixtures::seat_config(course_id, 2, 5))
        .await
        .expect("seat config");
}

fn waiting_entry(course: &str, student: &str, composite: f64) -> WaitlistEntry {
    WaitlistEntry {
        course_id: course.to_string(),
        student_id: student.to_string(),
        factors: enroll_core::FactorScores {
            gpa: 0.9,
            interest: 0.5,
            time: 1.0,
            year: 1.0,
            prereq: 1.0,
        },
        composite_score: composite,
        status: WaitlistStatus::Waiting,
        applied_at: Utc::now(),
        preferred_seat: None,
    }
}

#[tokio::test]
async fn entities_round_trip() {
    let (store, _dir) = setup().await;

    let mut student = fixtures::student("s1", 3.7, 2);
    student.interests.insert("ai".to_string());
    student.completed_courses.insert("cs100".to_string());
    store.upsert_student(&student).await.unwrap();

    let loaded = store.get_student("s1").await.unwrap().unwrap();
    assert_eq!(loaded.name, student.name);
    assert_eq!(loaded.gpa, student.gpa);
    assert!(loaded.interests.contains("ai"));
    assert!(loaded.completed_courses.contains("cs100"));
    assert!(store.get_student("ghost").await.unwrap().is_none());

    seed_course(&store, "c1", "CS101").await;
    let by_id = store.get_course("c1").await.unwrap().unwrap();
    let by_code = store.get_course("CS101").await.unwrap().unwrap();
    assert_eq!(by_id.id, by_code.id);
    assert_eq!(by_id.schedule.days, by_code.schedule.days);

    let config = store.get_seat_config("c1").await.unwrap().unwrap();
    assert_eq!(config.total_seats, 10);
    assert_eq!(config.booking_status, BookingStatus::Closed);
    assert_eq!(config.version, 0);
}

#[tokio::test]
async fn commit_applies_ops_atomically() {
    let (store, _dir) = setup().await;
    store
        .upsert_student(&fixtures::student("s1", 3.7, 2))
        .await
        .unwrap();
    seed_course(&store, "c1", "CS101").await;

    let booking = SeatBooking {
        course_id: "c1".to_string(),
        student_id: "s1".to_string(),
        seat_label: label("A1"),
        booked_at: Utc::now(),
        active: true,
    };
    let record = RegistrationEvent {
        event_type: RegistrationEventType::SeatBooked,
        student_id: Some("s1".to_string()),
        course_id: "c1".to_string(),
        seat_label: Some(label("A1")),
        metadata: serde_json::json!({ "source": "test" }),
        timestamp: Utc::now(),
    };

    let mut txn = CourseTxn::new("c1", 0);
    txn.push(TxnOp::InsertBooking(booking));
    txn.push(TxnOp::SetBookingStatus {
        status: BookingStatus::Open,
        opened_at: Some(Utc::now()),
    });
    txn.push(TxnOp::AppendEvent(record));
    store.commit(txn).await.unwrap();

    let bookings = store.active_bookings("c1").await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].seat_label, label("A1"));

    let config = store.get_seat_config("c1").await.unwrap().unwrap();
    assert_eq!(config.booking_status, BookingStatus::Open);
    assert_eq!(config.version, 1);

    let events = store.events_for_course("c1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["eventType"], "SEAT_BOOKED");
}

#[tokio::test]
async fn stale_version_is_a_conflict_and_rolls_back() {
    let (store, _dir) = setup().await;
    store
        .upsert_student(&fixtures::student("s1", 3.7, 2))
        .await
        .unwrap();
    seed_course(&store, "c1", "CS101").await;

    let mut txn = CourseTxn::new("c1", 7);
    txn.push(TxnOp::InsertBooking(SeatBooking {
        course_id: "c1".to_string(),
        student_id: "s1".to_string(),
        seat_label: label("A1"),
        booked_at: Utc::now(),
        active: true,
    }));
    let err = store.commit(txn).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Nothing from the failed transaction stuck.
    assert!(store.active_bookings("c1").await.unwrap().is_empty());
    let config = store.get_seat_config("c1").await.unwrap().unwrap();
    assert_eq!(config.version, 0);
}

#[tokio::test]
async fn active_uniqueness_is_enforced_as_conflict() {
    let (store, _dir) = setup().await;
    for id in ["s1", "s2"] {
        store
            .upsert_student(&fixtures::student(id, 3.0, 2))
            .await
            .unwrap();
    }
    seed_course(&store, "c1", "CS101").await;

    let booking = |student: &str, seat: &str| SeatBooking {
        course_id: "c1".to_string(),
        student_id: student.to_string(),
        seat_label: label(seat),
        booked_at: Utc::now(),
        active: true,
    };

    let mut txn = CourseTxn::new("c1", 0);
    txn.push(TxnOp::InsertBooking(booking("s1", "A1")));
    store.commit(txn).await.unwrap();

    // Same seat, different student.
    let mut txn = CourseTxn::new("c1", 1);
    txn.push(TxnOp::InsertBooking(booking("s2", "A1")));
    let err = store.commit(txn).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Same student, different seat.
    let mut txn = CourseTxn::new("c1", 1);
    txn.push(TxnOp::InsertBooking(booking("s1", "A2")));
    let err = store.commit(txn).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Dropping frees both uniqueness slots.
    let mut txn = CourseTxn::new("c1", 1);
    txn.push(TxnOp::DeactivateBooking {
        student_id: "s1".to_string(),
    });
    store.commit(txn).await.unwrap();
    let mut txn = CourseTxn::new("c1", 2);
    txn.push(TxnOp::InsertBooking(booking("s2", "A1")));
    store.commit(txn).await.unwrap();

    assert_eq!(store.active_bookings("c1").await.unwrap().len(), 1);
    assert!(store
        .active_booking_for("c1", "s1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn waitlist_entries_round_trip_in_canonical_order() {
    let (store, _dir) = setup().await;
    for id in ["s1", "s2", "s3"] {
        store
            .upsert_student(&fixtures::student(id, 3.0, 2))
            .await
            .unwrap();
    }
    seed_course(&store, "c1", "CS101").await;

    let mut txn = CourseTxn::new("c1", 0);
    txn.push(TxnOp::InsertWaitlistEntry(waiting_entry("c1", "s2", 0.5)));
    txn.push(TxnOp::InsertWaitlistEntry(waiting_entry("c1", "s1", 0.9)));
    txn.push(TxnOp::InsertWaitlistEntry(waiting_entry("c1", "s3", 0.7)));
    store.commit(txn).await.unwrap();

    let entries = store.waiting_entries("c1").await.unwrap();
    let ids: Vec<&str> = entries.iter().map(|e| e.student_id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s3", "s2"]);

    // Duplicate non-terminal entry for the same student is rejected.
    let mut txn = CourseTxn::new("c1", 1);
    txn.push(TxnOp::InsertWaitlistEntry(waiting_entry("c1", "s1", 0.1)));
    let err = store.commit(txn).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    // Terminal transition frees the slot.
    let mut txn = CourseTxn::new("c1", 1);
    txn.push(TxnOp::SetWaitlistStatus {
        student_id: "s1".to_string(),
        status: WaitlistStatus::Allocated,
    });
    store.commit(txn).await.unwrap();
    assert_eq!(store.waiting_entries("c1").await.unwrap().len(), 2);

    let mut txn = CourseTxn::new("c1", 2);
    txn.push(TxnOp::InsertWaitlistEntry(waiting_entry("c1", "s1", 0.2)));
    store.commit(txn).await.unwrap();
}

#[tokio::test]
async fn preferences_replace_en_bloc() {
    let (store, _dir) = setup().await;
    store
        .upsert_student(&fixtures::student("s1", 3.0, 2))
        .await
        .unwrap();
    seed_course(&store, "c1", "CS101").await;
    seed_course(&store, "c2", "CS102").await;

    let pref = |course: &str, priority: u32| CoursePreference {
        student_id: "s1".to_string(),
        course_id: course.to_string(),
        priority,
        match_reason: "match".to_string(),
    };

    store
        .replace_preferences("s1", &[pref("c1", 1), pref("c2", 2)])
        .await
        .unwrap();
    let prefs = store.preferences_for("s1").await.unwrap();
    assert_eq!(prefs.len(), 2);
    assert_eq!(prefs[0].course_id, "c1");

    store
        .replace_preferences("s1", &[pref("c2", 1)])
        .await
        .unwrap();
    let prefs = store.preferences_for("s1").await.unwrap();
    assert_eq!(prefs.len(), 1);
    assert_eq!(prefs[0].course_id, "c2");
    assert_eq!(prefs[0].priority, 1);
}
