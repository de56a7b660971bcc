use super::*;
use crate::limits::*;
use tokio_test::{assert_err, assert_ok};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("wardbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap();
    (engine, path)
}

fn t(s: &str) -> TimeOfDay {
    s.parse().unwrap()
}

fn d(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

fn room(name: &str, kind: &str, capacity: u32) -> Resource {
    Resource {
        id: Ulid::new(),
        name: name.into(),
        kind: kind.into(),
        capacity,
        equipment: vec![],
    }
}

fn request(resource_id: Ulid, date: &str, start: &str, end: &str) -> BookingRequest {
    BookingRequest {
        resource_id,
        date: d(date),
        start: t(start),
        end: t(end),
        motif: None,
        actor: "secretariat".into(),
    }
}

fn ids(resources: &[Resource]) -> Vec<Ulid> {
    resources.iter().map(|r| r.id).collect()
}

// ── Registry ─────────────────────────────────────────────

#[tokio::test]
async fn register_and_get_resource() {
    let (engine, _) = new_engine("register_get.wal");
    let mut r = room("Bloc A", "operating", 6);
    r.equipment.push(Equipment {
        name: "scialytique".into(),
        quantity: 2,
    });
    assert_ok!(engine.register_resource(r.clone()).await);

    assert_eq!(assert_ok!(engine.get_resource(r.id).await), r);
    assert_eq!(engine.resource_count(), 1);
}

#[tokio::test]
async fn duplicate_resource_rejected() {
    let (engine, _) = new_engine("duplicate.wal");
    let r = room("Salle 1", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let err = assert_err!(engine.register_resource(r.clone()).await);
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == r.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_registrations_exactly_one_wins() {
    let path = test_wal_path("concurrent_register.wal");
    let engine = Arc::new(Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap());
    let r = room("Salle 2", "consultation", 1);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        let r = r.clone();
        handles.push(tokio::spawn(async move { engine.register_resource(r).await }));
    }

    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(()) => wins += 1,
            Err(EngineError::AlreadyExists(id)) => assert_eq!(id, r.id),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.resource_count(), 1);

    let registered = Wal::replay(&path)
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e, Event::ResourceRegistered { .. }))
        .count();
    assert_eq!(registered, 1);
}

#[tokio::test]
async fn list_resources_in_registration_order() {
    let (engine, path) = new_engine("registry_order.wal");
    let rooms: Vec<Resource> = (0..8)
        .map(|i| room(&format!("Salle {i}"), "consultation", 1))
        .collect();
    for r in &rooms {
        engine.register_resource(r.clone()).await.unwrap();
    }
    assert_eq!(ids(&engine.list_resources().await), ids(&rooms));

    drop(engine);
    let engine = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(ids(&engine.list_resources().await), ids(&rooms));
}

#[tokio::test]
async fn list_resources_empty() {
    let (engine, _) = new_engine("list_empty.wal");
    assert!(engine.list_resources().await.is_empty());
}

#[tokio::test]
async fn update_resource_keeps_reservations() {
    let (engine, path) = new_engine("update_resource.wal");
    let r = room("Salle 2", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let booked = engine
        .book(request(r.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();

    let mut renamed = r.clone();
    renamed.name = "Salle 2 bis".into();
    renamed.capacity = 3;
    assert_ok!(engine.update_resource(renamed.clone()).await);
    assert_eq!(engine.get_resource(r.id).await.unwrap(), renamed);
    assert_eq!(
        engine.reservations_for(r.id, d("2025-01-10")).await,
        vec![booked.clone()]
    );

    drop(engine);
    let engine = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(engine.get_resource(r.id).await.unwrap().name, "Salle 2 bis");
    assert_eq!(engine.get_reservation(booked.id).await.unwrap(), booked);
}

#[tokio::test]
async fn update_unknown_resource() {
    let (engine, _) = new_engine("update_unknown.wal");
    let err = assert_err!(engine.update_resource(room("X", "consultation", 1)).await);
    assert!(matches!(err, EngineError::ResourceNotFound(_)));
}

#[tokio::test]
async fn remove_resource_refused_while_booked() {
    let (engine, _) = new_engine("remove_booked.wal");
    let r = room("Salle 3", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let booked = engine
        .book(request(r.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();

    let err = assert_err!(engine.remove_resource(r.id).await);
    assert!(matches!(err, EngineError::HasReservations(_)));

    engine.cancel(booked.id).await.unwrap();
    assert_ok!(engine.remove_resource(r.id).await);

    assert!(matches!(
        engine.get_resource(r.id).await,
        Err(EngineError::ResourceNotFound(_))
    ));
    assert!(matches!(
        engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await,
        Err(EngineError::ResourceNotFound(_))
    ));
    // The tombstone outlives its resource.
    assert_eq!(
        engine.get_reservation(booked.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
}

#[tokio::test]
async fn resource_limits() {
    let (engine, _) = new_engine("resource_limits.wal");
    let long_name = room(&"x".repeat(MAX_NAME_LEN + 1), "consultation", 1);
    assert!(matches!(
        engine.register_resource(long_name).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let mut many = room("Salle", "consultation", 1);
    many.equipment = (0..=MAX_EQUIPMENT_ITEMS)
        .map(|i| Equipment {
            name: format!("item {i}"),
            quantity: 1,
        })
        .collect();
    assert!(matches!(
        engine.register_resource(many).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let at_limit = room(&"x".repeat(MAX_NAME_LEN), "consultation", 1);
    assert_ok!(engine.register_resource(at_limit).await);
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn scenario_room_r1() {
    let (engine, _) = new_engine("scenario_r1.wal");
    let r1 = room("R1", "consultation", 1);
    engine.register_resource(r1.clone()).await.unwrap();
    let existing = engine
        .book(request(r1.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();
    let none = AvailabilityFilter::default();

    let during = engine
        .find_available(d("2025-01-10"), t("09:30"), t("09:45"), &none)
        .await
        .unwrap();
    assert!(!ids(&during).contains(&r1.id));

    let after = engine
        .find_available(d("2025-01-10"), t("10:00"), t("10:30"), &none)
        .await
        .unwrap();
    assert!(ids(&after).contains(&r1.id));

    let err = assert_err!(engine.book(request(r1.id, "2025-01-10", "09:00", "09:30")).await);
    match err {
        EngineError::Conflict { reservation_id, span } => {
            assert_eq!(reservation_id, existing.id);
            assert_eq!(span, existing.span);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn booking_records_actor_and_motif() {
    let (engine, _) = new_engine("actor_motif.wal");
    let r = room("Salle 5", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();

    let mut req = request(r.id, "2025-01-10", "14:00", "14:30");
    req.motif = Some("Consultation pré-op".into());
    req.actor = "dr.martin".into();
    let booked = assert_ok!(engine.book(req).await);

    assert_eq!(booked.created_by, "dr.martin");
    assert_eq!(booked.motif.as_deref(), Some("Consultation pré-op"));
    assert_eq!(booked.status, ReservationStatus::Confirmed);
    assert_eq!(booked.span, Span::new(t("14:00"), t("14:30")));
    assert_eq!(engine.get_reservation(booked.id).await.unwrap(), booked);
}

#[tokio::test]
async fn adjacent_bookings_do_not_conflict() {
    let (engine, _) = new_engine("adjacent.wal");
    let r = room("Salle 6", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();

    assert_ok!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await);
    assert_ok!(engine.book(request(r.id, "2025-01-10", "10:00", "11:00")).await);
    assert_ok!(engine.book(request(r.id, "2025-01-10", "08:00", "09:00")).await);
    // Same times, another day.
    assert_ok!(engine.book(request(r.id, "2025-01-11", "09:00", "10:00")).await);

    let day = engine.reservations_for(r.id, d("2025-01-10")).await;
    let starts: Vec<String> = day.iter().map(|r| r.span.start.to_string()).collect();
    assert_eq!(starts, vec!["08:00", "09:00", "10:00"]);
}

#[tokio::test]
async fn booking_until_midnight() {
    let (engine, _) = new_engine("until_midnight.wal");
    let r = room("Bloc B", "operating", 4);
    engine.register_resource(r.clone()).await.unwrap();
    assert_ok!(engine.book(request(r.id, "2025-01-10", "22:00", "24:00")).await);
    assert_ok!(engine.book(request(r.id, "2025-01-11", "00:00", "02:00")).await);
}

#[tokio::test]
async fn invalid_ranges_rejected() {
    let (engine, _) = new_engine("invalid_ranges.wal");
    let r = room("Salle 7", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();

    for (start, end) in [("10:00", "10:00"), ("11:00", "10:00")] {
        let err = assert_err!(engine.book(request(r.id, "2025-01-10", start, end)).await);
        assert!(matches!(err, EngineError::InvalidRange(_)), "{start}-{end}: {err:?}");
    }
    let err = assert_err!(engine.book(request(r.id, "1999-12-31", "09:00", "10:00")).await);
    assert!(matches!(err, EngineError::InvalidRange(_)));

    let err = assert_err!(
        engine
            .find_available(d("2025-01-10"), t("10:00"), t("09:00"), &AvailabilityFilter::default())
            .await
    );
    assert!(matches!(err, EngineError::InvalidRange(_)));
    assert!(engine.reservations_for(r.id, d("2025-01-10")).await.is_empty());
}

#[tokio::test]
async fn invalid_range_checked_before_resource() {
    let (engine, _) = new_engine("range_before_resource.wal");
    let err = assert_err!(engine.book(request(Ulid::new(), "2025-01-10", "10:00", "09:00")).await);
    assert!(matches!(err, EngineError::InvalidRange(_)));
    let err = assert_err!(engine.book(request(Ulid::new(), "2025-01-10", "09:00", "10:00")).await);
    assert!(matches!(err, EngineError::ResourceNotFound(_)));
}

#[tokio::test]
async fn motif_and_actor_limits() {
    let (engine, _) = new_engine("motif_limits.wal");
    let r = room("Salle 8", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();

    let mut req = request(r.id, "2025-01-10", "09:00", "10:00");
    req.motif = Some("m".repeat(MAX_MOTIF_LEN + 1));
    assert!(matches!(
        engine.book(req).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let mut req = request(r.id, "2025-01-10", "09:00", "10:00");
    req.actor = "a".repeat(MAX_ACTOR_LEN + 1);
    assert!(matches!(
        engine.book(req).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let mut req = request(r.id, "2025-01-10", "09:00", "10:00");
    req.motif = Some("m".repeat(MAX_MOTIF_LEN));
    assert_ok!(engine.book(req).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_exactly_one_wins() {
    let path = test_wal_path("concurrent_same.wal");
    let engine = Arc::new(Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap());
    let r = room("Bloc C", "operating", 8);
    engine.register_resource(r.clone()).await.unwrap();

    // Every request covers 10:00-10:01, so all pairs overlap.
    let n = 32u16;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = engine.clone();
        let req = BookingRequest {
            resource_id: r.id,
            date: d("2025-01-10"),
            start: TimeOfDay::from_minutes(600 - i).unwrap(),
            end: TimeOfDay::from_minutes(601 + i).unwrap(),
            motif: None,
            actor: format!("actor-{i}"),
        };
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, n - 1);
    assert_eq!(engine.reservations_for(r.id, d("2025-01-10")).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_on_different_resources_all_succeed() {
    let path = test_wal_path("concurrent_distinct.wal");
    let engine = Arc::new(Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap());

    let mut rooms = Vec::new();
    for i in 0..16 {
        let r = room(&format!("Salle {i}"), "consultation", 1);
        engine.register_resource(r.clone()).await.unwrap();
        rooms.push(r);
    }

    let mut handles = Vec::new();
    for r in &rooms {
        let engine = engine.clone();
        let req = request(r.id, "2025-01-10", "09:00", "10:00");
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    assert_eq!(engine.confirmed_count(), rooms.len());
}

#[tokio::test]
async fn lock_wait_times_out_and_is_retryable() {
    let path = test_wal_path("lock_timeout.wal");
    let engine = Engine::new(path, Duration::from_millis(50)).unwrap();
    let r = room("Salle 9", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();

    let lease = engine.lock_resource(r.id).await.unwrap();
    let err = assert_err!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await);
    assert!(matches!(err, EngineError::Timeout(id) if id == r.id));
    assert!(err.is_retryable());

    drop(lease);
    assert!(engine.reservations_for(r.id, d("2025-01-10")).await.is_empty());
    assert_ok!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await);
}

#[tokio::test]
async fn held_lock_does_not_block_other_resources() {
    let path = test_wal_path("lock_isolation.wal");
    let engine = Engine::new(path, Duration::from_millis(50)).unwrap();
    let a = room("Salle A", "consultation", 1);
    let b = room("Salle B", "consultation", 1);
    engine.register_resource(a.clone()).await.unwrap();
    engine.register_resource(b.clone()).await.unwrap();

    let _lease = engine.lock_resource(a.id).await.unwrap();
    assert_ok!(engine.book(request(b.id, "2025-01-10", "09:00", "10:00")).await);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_is_not_repeatable_and_frees_interval() {
    let (engine, _) = new_engine("cancel_idempotent.wal");
    let r = room("Salle 10", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let booked = engine
        .book(request(r.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();

    let cancelled = assert_ok!(engine.cancel(booked.id).await);
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.span, booked.span);

    let err = assert_err!(engine.cancel(booked.id).await);
    assert!(matches!(err, EngineError::NotFound(id) if id == booked.id));
    let err = assert_err!(engine.cancel(Ulid::new()).await);
    assert!(matches!(err, EngineError::NotFound(_)));

    let free = engine
        .find_available(d("2025-01-10"), t("09:00"), t("10:00"), &AvailabilityFilter::default())
        .await
        .unwrap();
    assert!(ids(&free).contains(&r.id));
    assert!(engine.reservations_for(r.id, d("2025-01-10")).await.is_empty());
    assert_eq!(engine.get_reservation(booked.id).await.unwrap(), cancelled);

    assert_ok!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_exactly_one_wins() {
    let path = test_wal_path("concurrent_cancel.wal");
    let engine = Arc::new(Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap());
    let r = room("Salle 11", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let booked = engine
        .book(request(r.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.cancel(booked.id).await }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::NotFound(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn available_resource_can_be_booked() {
    let (engine, _) = new_engine("avail_then_book.wal");
    let mut rooms = Vec::new();
    for i in 0..5 {
        let r = room(&format!("Salle {i}"), "consultation", 1);
        engine.register_resource(r.clone()).await.unwrap();
        rooms.push(r);
    }
    engine
        .book(request(rooms[1].id, "2025-01-10", "08:30", "09:15"))
        .await
        .unwrap();
    engine
        .book(request(rooms[3].id, "2025-01-10", "09:45", "11:00"))
        .await
        .unwrap();

    let free = engine
        .find_available(d("2025-01-10"), t("09:00"), t("10:00"), &AvailabilityFilter::default())
        .await
        .unwrap();
    assert_eq!(ids(&free), vec![rooms[0].id, rooms[2].id, rooms[4].id]);
    for r in free {
        assert_ok!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await);
    }
}

#[tokio::test]
async fn availability_filters_kind_and_capacity() {
    let (engine, _) = new_engine("avail_filters.wal");
    let small = room("Salle 1", "consultation", 1);
    let large = room("Salle 2", "consultation", 4);
    let bloc = room("Bloc A", "operating", 6);
    for r in [&small, &large, &bloc] {
        engine.register_resource(r.clone()).await.unwrap();
    }

    let by_kind = AvailabilityFilter {
        kind: Some("Consultation".into()),
        min_capacity: None,
    };
    let free = engine
        .find_available(d("2025-01-10"), t("09:00"), t("10:00"), &by_kind)
        .await
        .unwrap();
    assert_eq!(ids(&free), vec![small.id, large.id]);

    let by_capacity = AvailabilityFilter {
        kind: None,
        min_capacity: Some(4),
    };
    let free = engine
        .find_available(d("2025-01-10"), t("09:00"), t("10:00"), &by_capacity)
        .await
        .unwrap();
    assert_eq!(ids(&free), vec![large.id, bloc.id]);
}

#[tokio::test]
async fn free_windows_around_bookings() {
    let (engine, _) = new_engine("free_windows.wal");
    let r = room("Salle 12", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    for (start, end) in [("09:00", "10:00"), ("10:00", "10:30"), ("14:00", "15:00")] {
        engine
            .book(request(r.id, "2025-01-10", start, end))
            .await
            .unwrap();
    }

    let windows = engine
        .free_windows(r.id, d("2025-01-10"), Span::new(t("08:00"), t("18:00")))
        .await
        .unwrap();
    assert_eq!(
        windows,
        vec![
            Span::new(t("08:00"), t("09:00")),
            Span::new(t("10:30"), t("14:00")),
            Span::new(t("15:00"), t("18:00")),
        ]
    );

    let whole_day = engine
        .free_windows(r.id, d("2025-01-11"), Span::whole_day())
        .await
        .unwrap();
    assert_eq!(whole_day, vec![Span::whole_day()]);

    let err = assert_err!(
        engine
            .free_windows(Ulid::new(), d("2025-01-10"), Span::whole_day())
            .await
    );
    assert!(matches!(err, EngineError::ResourceNotFound(_)));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_reservations_and_tombstones() {
    let path = test_wal_path("replay.wal");
    let r = room("Salle 13", "consultation", 1);
    let (kept, cancelled) = {
        let engine = Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap();
        engine.register_resource(r.clone()).await.unwrap();
        let kept = engine
            .book(request(r.id, "2025-01-10", "09:00", "10:00"))
            .await
            .unwrap();
        let gone = engine
            .book(request(r.id, "2025-01-10", "11:00", "12:00"))
            .await
            .unwrap();
        let cancelled = engine.cancel(gone.id).await.unwrap();
        (kept, cancelled)
    };

    let engine = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(
        engine.reservations_for(r.id, d("2025-01-10")).await,
        vec![kept.clone()]
    );
    assert_eq!(engine.get_reservation(cancelled.id).await.unwrap(), cancelled);
    assert!(matches!(
        engine.book(request(r.id, "2025-01-10", "09:30", "10:30")).await,
        Err(EngineError::Conflict { .. })
    ));
    assert_ok!(engine.book(request(r.id, "2025-01-10", "11:00", "12:00")).await);
}

#[tokio::test]
async fn bookings_after_torn_tail_survive_restart() {
    let path = test_wal_path("torn_tail.wal");
    let r = room("Salle 14", "consultation", 1);
    {
        let engine = Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap();
        engine.register_resource(r.clone()).await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let booked = {
        let engine = Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(engine.resource_count(), 1);
        assert_ok!(engine.book(request(r.id, "2025-01-10", "09:00", "10:00")).await)
    };

    let engine = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(engine.confirmed_count(), 1);
    assert_eq!(
        engine.reservations_for(r.id, d("2025-01-10")).await,
        vec![booked]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap());
    let r = room("Bloc D", "operating", 2);
    engine.register_resource(r.clone()).await.unwrap();

    let n = 20u16;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = engine.clone();
        let req = BookingRequest {
            resource_id: r.id,
            date: d("2025-01-10"),
            start: TimeOfDay::from_minutes(i * 30).unwrap(),
            end: TimeOfDay::from_minutes(i * 30 + 30).unwrap(),
            motif: None,
            actor: "planning".into(),
        };
        handles.push(tokio::spawn(async move { engine.book(req).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let engine2 = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(
        engine2.reservations_for(r.id, d("2025-01-10")).await.len(),
        n as usize
    );
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let (engine, _) = new_engine("appends_counter.wal");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let r = room("Salle 14", "consultation", 1);
    engine.register_resource(r.clone()).await.unwrap();
    let booked = engine
        .book(request(r.id, "2025-01-10", "09:00", "10:00"))
        .await
        .unwrap();
    engine.cancel(booked.id).await.unwrap();

    assert_eq!(engine.wal_appends_since_compact().await, 3);
}

#[tokio::test]
async fn compact_wal_preserves_state_and_expires_old_tombstones() {
    let path = test_wal_path("compact_state.wal");
    let r = room("Bloc E", "operating", 6);
    let old_cancel;
    let recent_cancel;
    let kept;
    {
        let engine = Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap();
        engine.register_resource(r.clone()).await.unwrap();
        let removed = room("Salle temporaire", "consultation", 1);
        engine.register_resource(removed.clone()).await.unwrap();
        engine.remove_resource(removed.id).await.unwrap();

        for hour in 8..16u16 {
            let booked = engine
                .book(BookingRequest {
                    resource_id: r.id,
                    date: d("2025-03-01"),
                    start: TimeOfDay::from_hm(hour, 0).unwrap(),
                    end: TimeOfDay::from_hm(hour, 45).unwrap(),
                    motif: Some("churn".into()),
                    actor: "planning".into(),
                })
                .await
                .unwrap();
            engine.cancel(booked.id).await.unwrap();
        }
        let old = engine
            .book(request(r.id, "2025-01-10", "09:00", "10:00"))
            .await
            .unwrap();
        old_cancel = engine.cancel(old.id).await.unwrap();
        let recent = engine
            .book(request(r.id, "2025-03-02", "09:00", "10:00"))
            .await
            .unwrap();
        recent_cancel = engine.cancel(recent.id).await.unwrap();
        kept = engine
            .book(request(r.id, "2025-03-02", "10:00", "12:00"))
            .await
            .unwrap();

        let size_before = std::fs::metadata(&path).unwrap().len();
        assert_ok!(engine.compact_wal(d("2025-03-02")).await);
        let size_after = std::fs::metadata(&path).unwrap().len();
        assert!(size_after < size_before, "{size_after} < {size_before}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        assert!(matches!(
            engine.get_reservation(old_cancel.id).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.get_reservation(recent_cancel.id).await.unwrap(), recent_cancel);

        // Appends after compaction land in the new log.
        engine
            .book(request(r.id, "2025-03-02", "14:00", "15:00"))
            .await
            .unwrap();
    }

    let engine = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    assert_eq!(ids(&engine.list_resources().await), vec![r.id]);
    let day = engine.reservations_for(r.id, d("2025-03-02")).await;
    assert_eq!(day.len(), 2);
    assert_eq!(day[0], kept);
    assert_eq!(engine.get_reservation(recent_cancel.id).await.unwrap(), recent_cancel);
    assert!(engine.get_reservation(old_cancel.id).await.is_err());
    assert!(engine.reservations_for(r.id, d("2025-03-01")).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_concurrent_with_bookings_loses_nothing() {
    let path = test_wal_path("compact_concurrent.wal");
    let engine = Arc::new(Engine::new(path.clone(), DEFAULT_LOCK_TIMEOUT).unwrap());
    let mut rooms = Vec::new();
    for i in 0..4 {
        let r = room(&format!("Salle {i}"), "consultation", 1);
        engine.register_resource(r.clone()).await.unwrap();
        rooms.push(r);
    }

    let mut handles = Vec::new();
    for r in &rooms {
        let engine = engine.clone();
        let rid = r.id;
        handles.push(tokio::spawn(async move {
            for slot in 0..24u16 {
                let req = BookingRequest {
                    resource_id: rid,
                    date: d("2025-01-10"),
                    start: TimeOfDay::from_minutes(slot * 60).unwrap(),
                    end: TimeOfDay::from_minutes(slot * 60 + 60).unwrap(),
                    motif: None,
                    actor: "planning".into(),
                };
                engine.book(req).await.unwrap();
            }
        }));
    }
    let compactor = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                engine.compact_wal(d("2025-01-01")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for h in handles {
        h.await.unwrap();
    }
    compactor.await.unwrap();

    let engine2 = Engine::new(path, DEFAULT_LOCK_TIMEOUT).unwrap();
    for r in &rooms {
        assert_eq!(engine2.reservations_for(r.id, d("2025-01-10")).await.len(), 24);
    }
}
