use super::*;
use crate::clock::ManualClock;
use crate::lifecycle::AppointmentEvent;
use crate::limits::*;
use crate::policy::LeadTimeViolation;
use chrono::{NaiveDate, NaiveTime};
use proptest::prelude::*;

/// 2030-01-07T00:00:00Z, a Monday.
const MONDAY: Ms = 1_893_974_400_000;

fn at(h: i64, m: i64) -> Ms {
    MONDAY + h * HOUR_MS + m * MINUTE_MS
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotguard_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn registered_patient() -> PatientRef {
    PatientRef::Registered {
        patient_id: Ulid::new(),
    }
}

fn anonymous_patient() -> PatientRef {
    PatientRef::Anonymous {
        contact: ContactSnapshot::V1 {
            name: "Lucía Pérez".into(),
            email: "lucia@example.com".into(),
            phone: None,
        },
    }
}

/// One professional, one location, a plain 30-minute consultation type and
/// a Monday 09:00–12:00 rule with 30-minute granularity.
struct Clinic {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    path: PathBuf,
    pid: Ulid,
    lid: Ulid,
    ct: Ulid,
}

async fn clinic(name: &str) -> Clinic {
    clinic_with(name, ProfessionalPolicy::default(), "UTC").await
}

async fn clinic_with(name: &str, policy: ProfessionalPolicy, timezone: &str) -> Clinic {
    let path = test_wal_path(name);
    let clock = Arc::new(ManualClock::new(MONDAY - DAY_MS));
    let engine = Arc::new(
        Engine::with_clock(path.clone(), Arc::new(NotifyHub::new()), clock.clone()).unwrap(),
    );
    let pid = Ulid::new();
    let lid = Ulid::new();
    engine
        .register_professional(pid, "Dr. Gómez".into(), policy)
        .await
        .unwrap();
    engine
        .add_location(Location {
            id: lid,
            professional_id: pid,
            name: "Consultorio Centro".into(),
            is_virtual: false,
            timezone: timezone.into(),
        })
        .await
        .unwrap();
    let clinic = Clinic {
        engine,
        clock,
        path,
        pid,
        lid,
        ct: Ulid::nil(),
    };
    let ct = clinic.add_type("initial", 30 * MINUTE_MS, None, None, None).await;
    clinic
        .engine
        .add_rule(WeeklyRule {
            id: Ulid::new(),
            professional_id: pid,
            location_id: lid,
            weekday: 0,
            start: hm(9, 0),
            end: hm(12, 0),
            slot_granularity: 30 * MINUTE_MS,
        })
        .await
        .unwrap();
    Clinic { ct, ..clinic }
}

impl Clinic {
    async fn add_type(
        &self,
        code: &str,
        duration: Ms,
        buffer_before: Option<Ms>,
        buffer_after: Option<Ms>,
        price_cents: Option<u64>,
    ) -> Ulid {
        let id = Ulid::new();
        self.engine
            .add_consultation_type(ConsultationType {
                id,
                professional_id: self.pid,
                code: code.into(),
                duration,
                buffer_before,
                buffer_after,
                price_cents,
            })
            .await
            .unwrap();
        id
    }

    fn request(&self, ct: Ulid, start: Ms, duration: Ms, state: AppointmentState) -> NewAppointment {
        NewAppointment {
            id: Ulid::new(),
            professional_id: self.pid,
            location_id: self.lid,
            consultation_type_id: ct,
            span: Span::new(start, start + duration),
            requested_state: state,
            patient: registered_patient(),
            source: BookingSource::Internal,
            channel: Channel::InPerson,
            notes: None,
            hold_expires_at: None,
        }
    }

    async fn book(&self, start: Ms, state: AppointmentState) -> Result<Appointment, EngineError> {
        self.engine
            .create_appointment(self.request(self.ct, start, 30 * MINUTE_MS, state))
            .await
    }

    async fn slot_starts(&self, ct: Option<Ulid>) -> Vec<Ms> {
        self.engine
            .get_slots(SlotQuery {
                professional_id: self.pid,
                date_from: monday(),
                date_to: monday(),
                consultation_type_id: ct,
                location_id: None,
                duration: None,
            })
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.start)
            .collect()
    }

    fn reopen(&self) -> Engine {
        Engine::with_clock(self.path.clone(), Arc::new(NotifyHub::new()), self.clock.clone()).unwrap()
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn monday_rule_yields_six_slots() {
    let c = clinic("six_slots.wal").await;
    let slots = c
        .engine
        .get_slots(SlotQuery {
            professional_id: c.pid,
            date_from: monday(),
            date_to: monday(),
            consultation_type_id: Some(c.ct),
            location_id: Some(c.lid),
            duration: None,
        })
        .await
        .unwrap();
    let expected: Vec<Slot> = (0..6)
        .map(|i| Slot {
            start: at(9, 30 * i),
            end: at(9, 30 * i + 30),
        })
        .collect();
    assert_eq!(slots, expected);

    // Unchanged obstacles, same answer.
    assert_eq!(c.slot_starts(Some(c.ct)).await, c.slot_starts(Some(c.ct)).await);
}

#[tokio::test]
async fn partial_block_removes_only_the_overlapping_candidate() {
    let c = clinic("partial_block.wal").await;
    c.engine
        .add_block(Block {
            id: Ulid::new(),
            professional_id: c.pid,
            location_id: c.lid,
            span: Span::new(at(10, 0), at(10, 20)),
            reason: Some("staff meeting".into()),
        })
        .await
        .unwrap();
    assert_eq!(
        c.slot_starts(Some(c.ct)).await,
        vec![at(9, 0), at(9, 30), at(10, 30), at(11, 0), at(11, 30)]
    );
}

#[tokio::test]
async fn buffers_block_the_expanded_span_but_slots_stay_inner() {
    let c = clinic("buffers.wal").await;
    let buffered = c
        .add_type("follow_up", 30 * MINUTE_MS, Some(10 * MINUTE_MS), Some(5 * MINUTE_MS), None)
        .await;
    let appt = c
        .engine
        .create_appointment(c.request(buffered, at(10, 0), 30 * MINUTE_MS, AppointmentState::Reserved))
        .await
        .unwrap();
    assert_eq!(appt.effective_span(), Span::new(at(9, 50), at(10, 35)));

    // Plain 30-minute slots that touch 09:50–10:35 disappear; reported
    // slots never include buffer margins.
    let slots = c
        .engine
        .get_slots(SlotQuery {
            professional_id: c.pid,
            date_from: monday(),
            date_to: monday(),
            consultation_type_id: Some(c.ct),
            location_id: None,
            duration: None,
        })
        .await
        .unwrap();
    assert!(slots.iter().all(|s| s.end - s.start == 30 * MINUTE_MS));
    let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
    assert_eq!(starts, vec![at(9, 0), at(11, 0), at(11, 30)]);

    // Abutting the expanded span is fine; overlapping it is not.
    c.book(at(10, 35), AppointmentState::Reserved).await.unwrap();
    let err = c.book(at(9, 30), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SlotConflict { conflicting } if conflicting == Span::new(at(9, 50), at(10, 35))
    ));
    c.book(at(9, 20), AppointmentState::Reserved).await.unwrap();
}

#[tokio::test]
async fn location_timezone_shifts_the_rule_window() {
    let c = clinic_with(
        "cordoba.wal",
        ProfessionalPolicy::default(),
        "America/Argentina/Cordoba",
    )
    .await;
    let starts = c.slot_starts(Some(c.ct)).await;
    assert_eq!(starts.first(), Some(&at(12, 0)));
    assert_eq!(starts.len(), 6);

    // 09:00 UTC is 06:00 in Córdoba.
    let err = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::OutsideAvailability(_)));
    c.book(at(12, 0), AppointmentState::Reserved).await.unwrap();
}

#[tokio::test]
async fn slot_query_range_is_capped_at_31_days() {
    let c = clinic("range_cap.wal").await;
    let query = |to: NaiveDate| SlotQuery {
        professional_id: c.pid,
        date_from: monday(),
        date_to: to,
        consultation_type_id: Some(c.ct),
        location_id: None,
        duration: None,
    };
    let thirty_one = c
        .engine
        .get_slots(query(NaiveDate::from_ymd_opt(2030, 2, 6).unwrap()))
        .await
        .unwrap();
    // Five Mondays between Jan 7 and Feb 6.
    assert_eq!(thirty_one.len(), 5 * 6);

    let err = c
        .engine
        .get_slots(query(NaiveDate::from_ymd_opt(2030, 2, 7).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let err = c
        .engine
        .get_slots(query(NaiveDate::from_ymd_opt(2030, 1, 6).unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn slots_fall_back_to_caller_duration_then_granularity() {
    let c = clinic("duration_fallback.wal").await;
    let query = |duration: Option<Ms>| SlotQuery {
        professional_id: c.pid,
        date_from: monday(),
        date_to: monday(),
        consultation_type_id: None,
        location_id: None,
        duration,
    };
    let hour = c.engine.get_slots(query(Some(HOUR_MS))).await.unwrap();
    assert_eq!(hour.len(), 3);
    assert!(hour.iter().all(|s| s.end - s.start == HOUR_MS));

    let granular = c.engine.get_slots(query(None)).await.unwrap();
    assert_eq!(granular.len(), 6);
}

// ── Reservation Guard ────────────────────────────────────

#[tokio::test]
async fn lapsed_hold_is_absent_for_slots_and_booking() {
    let c = clinic("lazy_expiry.wal").await;
    let mut req = c.request(c.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Tentative);
    req.source = BookingSource::Public;
    req.patient = anonymous_patient();
    let hold = c.engine.create_appointment(req).await.unwrap();
    assert_eq!(hold.soft_hold_expires_at, Some(MONDAY - DAY_MS + 15 * MINUTE_MS));

    assert_eq!(c.slot_starts(Some(c.ct)).await.len(), 5);
    let err = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));

    // Expiry is exclusive: at the expiry instant the hold is gone.
    c.clock.advance(15 * MINUTE_MS);
    assert_eq!(c.slot_starts(Some(c.ct)).await.len(), 6);
    let firm = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();

    let listed = c.engine.list_appointments(c.pid, None, None).await.unwrap();
    assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![firm.id]);
    // The lapsed row is still readable until the reaper deletes it.
    let stored = c.engine.get_appointment(hold.id).await.unwrap();
    assert_eq!(stored.state, AppointmentState::Tentative);
}

#[tokio::test]
async fn lead_time_boundaries() {
    let c = clinic("lead_time.wal").await;
    let start = at(11, 0);

    c.clock.set(start - 2 * HOUR_MS + 1_000);
    let err = c.book(start, AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::LeadTimeViolation(LeadTimeViolation::TooSoon { min_lead_time, .. })
            if min_lead_time == 2 * HOUR_MS
    ));

    c.clock.set(start - 2 * HOUR_MS);
    c.book(start, AppointmentState::Reserved).await.unwrap();

    // Default horizon is 60 days.
    c.clock.set(MONDAY - 61 * DAY_MS);
    let err = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::LeadTimeViolation(LeadTimeViolation::TooFar { .. })
    ));
}

#[tokio::test]
async fn guard_checks_ownership_duration_and_rules() {
    let c = clinic("guard_checks.wal").await;
    let other = clinic("guard_checks_other.wal").await;

    let mut foreign_location = c.request(c.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Reserved);
    foreign_location.location_id = other.lid;
    let err = c.engine.create_appointment(foreign_location).await.unwrap_err();
    assert!(matches!(err, EngineError::OwnershipMismatch { entity: "location", .. }));

    let foreign_type = c.request(other.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Reserved);
    let err = c.engine.create_appointment(foreign_type).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::OwnershipMismatch {
            entity: "consultation type",
            ..
        }
    ));

    let too_long = c.request(c.ct, at(9, 0), 45 * MINUTE_MS, AppointmentState::Reserved);
    let err = c.engine.create_appointment(too_long).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::DurationMismatch { expected, actual }
            if expected == 30 * MINUTE_MS && actual == 45 * MINUTE_MS
    ));
    // One minute of drift is tolerated.
    let drift = c.request(c.ct, at(9, 0), 31 * MINUTE_MS, AppointmentState::Reserved);
    c.engine.create_appointment(drift).await.unwrap();

    // Tuesday has no rule; 11:45 runs past the window end.
    let err = c.book(at(24 + 9, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::OutsideAvailability(_)));
    let err = c.book(at(11, 45), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::OutsideAvailability(_)));

    let bad_state = c.request(c.ct, at(10, 0), 30 * MINUTE_MS, AppointmentState::Attended);
    let err = c.engine.create_appointment(bad_state).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let mut long_hold = c.request(c.ct, at(10, 0), 30 * MINUTE_MS, AppointmentState::Tentative);
    long_hold.hold_expires_at = Some(c.engine.now() + 8 * DAY_MS);
    let err = c.engine.create_appointment(long_hold).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn duplicate_appointment_id_is_rejected() {
    let c = clinic("duplicate_id.wal").await;
    let req = c.request(c.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Reserved);
    c.engine.create_appointment(req.clone()).await.unwrap();
    let mut again = req.clone();
    again.span = Span::new(at(10, 0), at(10, 30));
    let err = c.engine.create_appointment(again).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == req.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_booking_race_has_one_winner() {
    let c = clinic("race.wal").await;
    for round in 0..20 {
        let start = at(9, 0) + (round % 6) * 30 * MINUTE_MS + (round / 6) * 7 * DAY_MS;
        let a = c.request(c.ct, start, 30 * MINUTE_MS, AppointmentState::Reserved);
        let b = c.request(c.ct, start, 30 * MINUTE_MS, AppointmentState::Tentative);
        let (ea, eb) = (c.engine.clone(), c.engine.clone());
        let ha = tokio::spawn(async move { ea.create_appointment(a).await });
        let hb = tokio::spawn(async move { eb.create_appointment(b).await });
        let results = [ha.await.unwrap(), hb.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::SlotConflict { .. }))));
    }
}

fn no_overlap_case(ops: Vec<(i64, u8, bool)>) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async move {
        let c = clinic(&format!("prop_{}.wal", Ulid::new())).await;
        let buffered = c
            .add_type("buffered", 30 * MINUTE_MS, Some(5 * MINUTE_MS), Some(10 * MINUTE_MS), None)
            .await;

        let mut handles = Vec::new();
        for (slot, state, with_buffers) in ops {
            let state = match state {
                0 => AppointmentState::Tentative,
                1 => AppointmentState::Reserved,
                _ => AppointmentState::Confirmed,
            };
            let ct = if with_buffers { buffered } else { c.ct };
            let req = c.request(ct, at(9, 0) + slot * 15 * MINUTE_MS, 30 * MINUTE_MS, state);
            let engine = c.engine.clone();
            handles.push(tokio::spawn(async move { engine.create_appointment(req).await }));
        }
        for h in handles {
            match h.await.unwrap() {
                Ok(_) | Err(EngineError::SlotConflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let now = c.engine.now();
        let live: Vec<Appointment> = c
            .engine
            .list_appointments(c.pid, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.is_occupying(now))
            .collect();
        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                assert!(
                    !a.effective_span().overlaps(&b.effective_span()),
                    "{:?} overlaps {:?}",
                    a.effective_span(),
                    b.effective_span()
                );
            }
        }
        let _ = std::fs::remove_file(&c.path);
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_reservations_never_overlap(
        ops in prop::collection::vec((0i64..11, 0u8..3, any::<bool>()), 1..24)
    ) {
        no_overlap_case(ops);
    }
}

// ── State machine ────────────────────────────────────────

#[tokio::test]
async fn approve_revalidates_against_firm_obstacles() {
    let c = clinic("approve.wal").await;
    let first = c.book(at(9, 0), AppointmentState::Tentative).await.unwrap();
    let second = c.book(at(10, 0), AppointmentState::Tentative).await.unwrap();

    c.engine
        .add_block(Block {
            id: Ulid::new(),
            professional_id: c.pid,
            location_id: c.lid,
            span: Span::new(at(9, 0), at(9, 30)),
            reason: None,
        })
        .await
        .unwrap();
    let err = c
        .engine
        .transition_appointment(first.id, AppointmentEvent::Approve, ActorRole::Professional)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));

    let approved = c
        .engine
        .transition_appointment(second.id, AppointmentEvent::Approve, ActorRole::Professional)
        .await
        .unwrap();
    assert_eq!(approved.state, AppointmentState::Confirmed);
    assert_eq!(
        c.engine.get_appointment(second.id).await.unwrap().state,
        AppointmentState::Confirmed
    );
}

#[tokio::test]
async fn expired_hold_cannot_be_approved() {
    let c = clinic("approve_expired.wal").await;
    let hold = c.book(at(9, 0), AppointmentState::Tentative).await.unwrap();
    c.clock.advance(15 * MINUTE_MS);
    let err = c
        .engine
        .transition_appointment(hold.id, AppointmentEvent::Approve, ActorRole::Professional)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentState::Tentative,
            ..
        }
    ));
}

#[tokio::test]
async fn patient_cancellation_respects_the_window() {
    let c = clinic("cancel_window.wal").await;
    let early = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();
    let late = c.book(at(11, 0), AppointmentState::Confirmed).await.unwrap();

    // 33h ahead: allowed and free of charge.
    let cancelled = c
        .engine
        .transition_appointment(early.id, AppointmentEvent::Cancel, ActorRole::Patient)
        .await
        .unwrap();
    assert_eq!(cancelled.state, AppointmentState::Cancelled);
    let cancellation = cancelled.cancellation.unwrap();
    assert!(cancellation.free);
    assert_eq!(cancellation.by, ActorRole::Patient);

    c.clock.set(at(9, 0));
    let err = c
        .engine
        .transition_appointment(late.id, AppointmentEvent::Cancel, ActorRole::Patient)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CancellationWindowViolation { min_lead, remaining }
            if min_lead == 12 * HOUR_MS && remaining == 2 * HOUR_MS
    ));

    let by_practice = c
        .engine
        .transition_appointment(late.id, AppointmentEvent::Cancel, ActorRole::Professional)
        .await
        .unwrap();
    assert!(!by_practice.cancellation.unwrap().free);

    // Terminal.
    let err = c
        .engine
        .transition_appointment(late.id, AppointmentEvent::Cancel, ActorRole::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    // The freed slot is bookable again.
    c.clock.set(MONDAY - DAY_MS);
    c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();
}

#[tokio::test]
async fn no_show_records_the_fee() {
    let policy = ProfessionalPolicy {
        no_show_fee: NoShowFee::Percent { basis_points: 2_500 },
        ..ProfessionalPolicy::default()
    };
    let c = clinic_with("no_show.wal", policy, "UTC").await;
    let paid = c.add_type("paid", 30 * MINUTE_MS, None, None, Some(10_000)).await;
    let appt = c
        .engine
        .create_appointment(c.request(paid, at(9, 0), 30 * MINUTE_MS, AppointmentState::Reserved))
        .await
        .unwrap();

    let confirmed = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::Confirm, ActorRole::Patient)
        .await
        .unwrap();
    assert_eq!(confirmed.state, AppointmentState::Confirmed);

    let err = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::MarkNoShow, ActorRole::Professional)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    c.clock.set(at(9, 10));
    let err = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::MarkNoShow, ActorRole::Patient)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    let no_show = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::MarkNoShow, ActorRole::Professional)
        .await
        .unwrap();
    assert_eq!(no_show.state, AppointmentState::NoShow);
    assert_eq!(no_show.no_show_fee_cents, Some(2_500));

    let fee_mail = c
        .engine
        .pending_notifications(MAX_NOTIFICATION_BATCH)
        .into_iter()
        .find(|n| n.template == NotificationTemplate::NoShowFee)
        .unwrap();
    assert_eq!(fee_mail.payload.amount_cents, Some(2_500));
    assert_eq!(fee_mail.appointment_id, Some(appt.id));
}

#[tokio::test]
async fn attended_requires_confirmation_first() {
    let c = clinic("attended.wal").await;
    let appt = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();
    c.clock.set(at(9, 5));
    let err = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::MarkAttended, ActorRole::Professional)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: AppointmentState::Reserved,
            event: AppointmentEvent::MarkAttended,
            ..
        }
    ));
    c.engine
        .transition_appointment(appt.id, AppointmentEvent::Confirm, ActorRole::Admin)
        .await
        .unwrap();
    let attended = c
        .engine
        .transition_appointment(appt.id, AppointmentEvent::MarkAttended, ActorRole::Professional)
        .await
        .unwrap();
    assert_eq!(attended.state, AppointmentState::Attended);

    let err = c
        .engine
        .transition_appointment(Ulid::new(), AppointmentEvent::Confirm, ActorRole::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Notification outbox ──────────────────────────────────

#[tokio::test]
async fn notifications_are_queued_by_outcome() {
    let c = clinic("notifications.wal").await;

    let mut public = c.request(c.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Tentative);
    public.source = BookingSource::Public;
    public.patient = anonymous_patient();
    let public = c.engine.create_appointment(public).await.unwrap();
    let internal = c.book(at(10, 0), AppointmentState::Tentative).await.unwrap();
    let reserved = c.book(at(11, 0), AppointmentState::Reserved).await.unwrap();

    let pending = c.engine.pending_notifications(MAX_NOTIFICATION_BATCH);
    let templates_for = |id: Ulid| -> Vec<NotificationTemplate> {
        pending
            .iter()
            .filter(|n| n.appointment_id == Some(id))
            .map(|n| n.template)
            .collect()
    };
    assert_eq!(
        templates_for(public.id),
        vec![NotificationTemplate::PublicBookingVerification]
    );
    assert_eq!(
        templates_for(internal.id),
        vec![NotificationTemplate::BookingPendingProfessional]
    );
    let mut reserved_templates = templates_for(reserved.id);
    reserved_templates.sort_by_key(|t| t.as_str());
    assert_eq!(
        reserved_templates,
        vec![
            NotificationTemplate::BookingReservedPatient,
            NotificationTemplate::BookingReservedProfessional,
        ]
    );

    let verification = pending
        .iter()
        .find(|n| n.appointment_id == Some(public.id))
        .unwrap();
    assert!(matches!(verification.payload.recipient, Recipient::Contact { .. }));
    assert_eq!(verification.payload.act_before, public.soft_hold_expires_at);
    assert_eq!(verification.payload.consultation_code, "initial");
    assert_eq!(verification.channel, NotificationChannel::Email);

    // Delivery worker acknowledges one; it leaves the queue for good.
    c.engine.mark_notification_sent(verification.id).await.unwrap();
    let after = c.engine.pending_notifications(MAX_NOTIFICATION_BATCH);
    assert_eq!(after.len(), pending.len() - 1);
    assert!(after.iter().all(|n| n.id != verification.id));
    let err = c.engine.mark_notification_sent(verification.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    assert_eq!(c.engine.pending_notifications(1).len(), 1);
}

// ── Reference data ───────────────────────────────────────

#[tokio::test]
async fn referenced_entities_are_protected() {
    let c = clinic("protect.wal").await;
    let appt = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();

    let err = c.engine.remove_consultation_type(c.pid, c.ct).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(id) if id == c.ct));
    let err = c.engine.remove_location(c.pid, c.lid).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));
    let err = c.engine.remove_professional(c.pid).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    // Cancelled rows still reference their type.
    c.engine
        .transition_appointment(appt.id, AppointmentEvent::Cancel, ActorRole::Admin)
        .await
        .unwrap();
    let err = c.engine.remove_consultation_type(c.pid, c.ct).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    let unused = c.add_type("unused", HOUR_MS, None, None, None).await;
    c.engine.remove_consultation_type(c.pid, unused).await.unwrap();
}

#[tokio::test]
async fn empty_location_removal_cascades() {
    let c = clinic("cascade.wal").await;
    let annex = Ulid::new();
    c.engine
        .add_location(Location {
            id: annex,
            professional_id: c.pid,
            name: "Anexo".into(),
            is_virtual: true,
            timezone: "UTC".into(),
        })
        .await
        .unwrap();
    let rule_id = Ulid::new();
    c.engine
        .add_rule(WeeklyRule {
            id: rule_id,
            professional_id: c.pid,
            location_id: annex,
            weekday: 0,
            start: hm(14, 0),
            end: hm(15, 0),
            slot_granularity: 30 * MINUTE_MS,
        })
        .await
        .unwrap();
    assert_eq!(c.slot_starts(Some(c.ct)).await.len(), 8);

    c.engine.remove_location(c.pid, annex).await.unwrap();
    assert_eq!(c.slot_starts(Some(c.ct)).await.len(), 6);
    assert!(matches!(
        c.engine.remove_rule(rule_id).await.unwrap_err(),
        EngineError::NotFound(_)
    ));

    // Duplicate names are refused.
    let err = c
        .engine
        .add_location(Location {
            id: Ulid::new(),
            professional_id: c.pid,
            name: "Consultorio Centro".into(),
            is_virtual: false,
            timezone: "UTC".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == c.lid));

    let err = c
        .engine
        .add_location(Location {
            id: Ulid::new(),
            professional_id: c.pid,
            name: "Marte".into(),
            is_virtual: false,
            timezone: "Mars/Olympus_Mons".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn professional_without_appointments_can_be_removed() {
    let c = clinic("remove_professional.wal").await;
    c.engine.remove_professional(c.pid).await.unwrap();
    assert!(c.engine.professional(&c.pid).is_none());
    let err = c
        .engine
        .get_slots(SlotQuery {
            professional_id: c.pid,
            date_from: monday(),
            date_to: monday(),
            consultation_type_id: None,
            location_id: None,
            duration: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Waitlist ─────────────────────────────────────────────

fn monday_morning_entry(c: &Clinic) -> WaitlistEntry {
    WaitlistEntry {
        id: Ulid::new(),
        professional_id: c.pid,
        patient_id: Ulid::new(),
        location_id: None,
        preferred_days: vec![0],
        time_window: Some((hm(9, 0), hm(12, 0))),
        notes: None,
        created_at: 0,
    }
}

#[tokio::test]
async fn cancellation_reports_matching_waitlist_entries() {
    let c = clinic("waitlist_freed.wal").await;
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    assert_eq!(entry.created_at, c.engine.now());

    let mut dup = monday_morning_entry(&c);
    dup.patient_id = entry.patient_id;
    let err = c.engine.join_waitlist(dup).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == entry.id));

    let appt = c.book(at(10, 0), AppointmentState::Reserved).await.unwrap();
    let mut feed = c.engine.notify.subscribe(c.pid);
    c.engine
        .transition_appointment(appt.id, AppointmentEvent::Cancel, ActorRole::Professional)
        .await
        .unwrap();

    let mut freed = None;
    while let Ok(item) = feed.try_recv() {
        if let FeedItem::SlotFreed { span, waitlist_entries, .. } = item {
            freed = Some((span, waitlist_entries));
        }
    }
    let (span, entries) = freed.unwrap();
    assert_eq!(span, appt.span);
    assert_eq!(entries, vec![entry.id]);

    // Tuesday does not match a Monday-only entry.
    let tuesday = Span::new(at(24 + 10, 0), at(24 + 10, 30));
    assert!(c.engine.waitlist_matches(c.pid, c.lid, tuesday).await.unwrap().is_empty());

    c.engine.leave_waitlist(entry.id).await.unwrap();
    assert!(c.engine.waitlist_matches(c.pid, c.lid, appt.span).await.unwrap().is_empty());
    assert!(matches!(
        c.engine.leave_waitlist(entry.id).await.unwrap_err(),
        EngineError::NotFound(_)
    ));
}

#[tokio::test]
async fn waitlist_offer_accept_and_decline() {
    let c = clinic("waitlist_offer.wal").await;
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    let now = c.engine.now();

    let offer = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(10, 0), at(10, 30)),
            now + HOUR_MS,
        )
        .await
        .unwrap();
    let mail = c
        .engine
        .pending_notifications(MAX_NOTIFICATION_BATCH)
        .into_iter()
        .find(|n| n.template == NotificationTemplate::WaitlistOffer)
        .unwrap();
    assert_eq!(mail.payload.act_before, Some(now + HOUR_MS));
    assert!(matches!(
        mail.payload.recipient,
        Recipient::Patient { patient_id } if patient_id == entry.patient_id
    ));

    let booked = c.engine.accept_offer(offer.id).await.unwrap();
    assert_eq!(booked.state, AppointmentState::Tentative);
    assert_eq!(booked.source, BookingSource::Waitlist);
    assert_eq!(booked.span, offer.span);
    assert_eq!(booked.soft_hold_expires_at, Some(now + 15 * MINUTE_MS));
    assert!(matches!(
        c.engine.accept_offer(offer.id).await.unwrap_err(),
        EngineError::InvalidInput(_)
    ));

    // Offering an occupied slot fails up front.
    let err = c
        .engine
        .offer_slot(Ulid::new(), entry.id, c.lid, c.ct, offer.span, now + HOUR_MS)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));

    let second = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(11, 0), at(11, 30)),
            now + MINUTE_MS,
        )
        .await
        .unwrap();
    c.engine.decline_offer(second.id).await.unwrap();
    assert!(matches!(
        c.engine.accept_offer(second.id).await.unwrap_err(),
        EngineError::InvalidInput(_)
    ));

    let third = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(11, 30), at(12, 0)),
            now + MINUTE_MS,
        )
        .await
        .unwrap();
    c.clock.advance(2 * MINUTE_MS);
    assert!(matches!(
        c.engine.accept_offer(third.id).await.unwrap_err(),
        EngineError::InvalidInput(_)
    ));
}

#[tokio::test]
async fn pending_offer_holds_its_slot_until_resolved() {
    let c = clinic("waitlist_offer_hold.wal").await;
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    let now = c.engine.now();

    let offer = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(10, 0), at(10, 30)),
            now + HOUR_MS,
        )
        .await
        .unwrap();
    let hold = c.engine.get_appointment(offer.appointment_id).await.unwrap();
    assert_eq!(hold.state, AppointmentState::Tentative);
    assert_eq!(hold.source, BookingSource::Waitlist);
    assert_eq!(hold.soft_hold_expires_at, Some(offer.expires_at));
    assert!(!c.slot_starts(Some(c.ct)).await.contains(&at(10, 0)));
    let err = c.book(at(10, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));

    let booked = c.engine.accept_offer(offer.id).await.unwrap();
    assert_eq!(booked.id, offer.appointment_id);
    assert!(matches!(
        c.engine.offers.get(&offer.id).unwrap().resolution,
        Some(OfferResolution::Accepted { appointment_id, .. }) if appointment_id == booked.id
    ));
    assert!(c.book(at(10, 0), AppointmentState::Reserved).await.is_err());

    // Declining gives the slot back.
    let declined = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(11, 0), at(11, 30)),
            now + HOUR_MS,
        )
        .await
        .unwrap();
    assert!(!c.slot_starts(Some(c.ct)).await.contains(&at(11, 0)));
    c.engine.decline_offer(declined.id).await.unwrap();
    assert!(c.slot_starts(Some(c.ct)).await.contains(&at(11, 0)));
    assert_eq!(
        c.engine.get_appointment(declined.appointment_id).await.unwrap().state,
        AppointmentState::Cancelled
    );

    // An offer left unanswered lapses with its hold.
    c.engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(11, 30), at(12, 0)),
            now + 30 * MINUTE_MS,
        )
        .await
        .unwrap();
    assert!(!c.slot_starts(Some(c.ct)).await.contains(&at(11, 30)));
    c.clock.advance(31 * MINUTE_MS);
    assert!(c.slot_starts(Some(c.ct)).await.contains(&at(11, 30)));
    c.book(at(11, 30), AppointmentState::Reserved).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_accept_and_decline_resolve_an_offer_once() {
    let c = clinic("waitlist_offer_race.wal").await;
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    for round in 0..6 {
        let start = at(9, 0) + round * 30 * MINUTE_MS;
        let offer = c
            .engine
            .offer_slot(
                Ulid::new(),
                entry.id,
                c.lid,
                c.ct,
                Span::new(start, start + 30 * MINUTE_MS),
                c.engine.now() + HOUR_MS,
            )
            .await
            .unwrap();
        let (ea, ed) = (c.engine.clone(), c.engine.clone());
        let ha = tokio::spawn(async move { ea.accept_offer(offer.id).await });
        let hd = tokio::spawn(async move { ed.decline_offer(offer.id).await });
        let (accepted, declined) = (ha.await.unwrap(), hd.await.unwrap());
        assert!(accepted.is_ok() != declined.is_ok(), "round {round}");

        let resolution = c.engine.offers.get(&offer.id).unwrap().resolution;
        let hold = c.engine.get_appointment(offer.appointment_id).await.unwrap();
        if accepted.is_ok() {
            assert!(matches!(resolution, Some(OfferResolution::Accepted { .. })));
            assert_eq!(hold.state, AppointmentState::Tentative);
        } else {
            assert!(matches!(resolution, Some(OfferResolution::Declined { .. })));
            assert_eq!(hold.state, AppointmentState::Cancelled);
        }
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let c = clinic("replay.wal").await;
    let reserved = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();
    let cancelled = c.book(at(10, 0), AppointmentState::Reserved).await.unwrap();
    c.engine
        .transition_appointment(cancelled.id, AppointmentEvent::Cancel, ActorRole::Professional)
        .await
        .unwrap();
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    let first = c.engine.pending_notifications(1)[0].id;
    c.engine.mark_notification_sent(first).await.unwrap();

    let restarted = c.reopen();
    assert_eq!(
        restarted.get_appointment(reserved.id).await.unwrap(),
        c.engine.get_appointment(reserved.id).await.unwrap()
    );
    assert_eq!(
        restarted.get_appointment(cancelled.id).await.unwrap().state,
        AppointmentState::Cancelled
    );
    assert_eq!(
        restarted.pending_notifications(MAX_NOTIFICATION_BATCH),
        c.engine.pending_notifications(MAX_NOTIFICATION_BATCH)
    );
    assert_eq!(
        restarted.waitlist_matches(c.pid, c.lid, cancelled.span).await.unwrap(),
        vec![entry]
    );

    // The restarted engine still guards the calendar.
    let err = restarted
        .create_appointment(c.request(c.ct, at(9, 0), 30 * MINUTE_MS, AppointmentState::Reserved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict { .. }));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let c = clinic("compaction.wal").await;
    let keep = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap();
    let gone = c.book(at(10, 0), AppointmentState::Tentative).await.unwrap();
    let cancelled = c.book(at(11, 0), AppointmentState::Confirmed).await.unwrap();
    c.engine
        .transition_appointment(cancelled.id, AppointmentEvent::Cancel, ActorRole::Admin)
        .await
        .unwrap();
    c.engine
        .add_block(Block {
            id: Ulid::new(),
            professional_id: c.pid,
            location_id: c.lid,
            span: Span::new(at(11, 30), at(12, 0)),
            reason: None,
        })
        .await
        .unwrap();
    let entry = c.engine.join_waitlist(monday_morning_entry(&c)).await.unwrap();
    let offer = c
        .engine
        .offer_slot(
            Ulid::new(),
            entry.id,
            c.lid,
            c.ct,
            Span::new(at(11, 0), at(11, 30)),
            c.engine.now() + HOUR_MS,
        )
        .await
        .unwrap();

    c.clock.advance(20 * MINUTE_MS);
    assert!(c.engine.purge_expired_hold(gone.id).await.unwrap());
    assert!(!c.engine.purge_expired_hold(keep.id).await.unwrap());

    assert!(c.engine.wal_appends_since_compact().await > 0);
    c.engine.compact_wal().await.unwrap();
    assert_eq!(c.engine.wal_appends_since_compact().await, 0);
    let late = c.book(at(10, 0), AppointmentState::Reserved).await.unwrap();

    let restarted = c.reopen();
    assert_eq!(
        restarted.offers.get(&offer.id).map(|o| o.value().clone()),
        Some(offer.clone())
    );
    for id in [keep.id, cancelled.id, late.id, offer.appointment_id] {
        assert_eq!(
            restarted.get_appointment(id).await.unwrap(),
            c.engine.get_appointment(id).await.unwrap()
        );
    }
    assert!(matches!(
        restarted.get_appointment(gone.id).await.unwrap_err(),
        EngineError::NotFound(_)
    ));
    assert_eq!(
        restarted.pending_notifications(MAX_NOTIFICATION_BATCH),
        c.engine.pending_notifications(MAX_NOTIFICATION_BATCH)
    );
    let query = SlotQuery {
        professional_id: c.pid,
        date_from: monday(),
        date_to: monday(),
        consultation_type_id: Some(c.ct),
        location_id: None,
        duration: None,
    };
    assert_eq!(
        restarted.get_slots(query.clone()).await.unwrap(),
        c.engine.get_slots(query).await.unwrap()
    );
}

#[tokio::test]
async fn failed_wal_commit_is_unavailable_and_applies_nothing() {
    let mut c = clinic("commit_failure.wal").await;
    // A writer that is gone fails every append.
    let (dead_tx, dead_rx) = mpsc::channel(1);
    drop(dead_rx);
    Arc::get_mut(&mut c.engine).unwrap().wal_tx = dead_tx;
    let mut feed = c.engine.notify.subscribe(c.pid);

    let err = c.book(at(9, 0), AppointmentState::Reserved).await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(_)));
    assert_eq!(err.code(), "unavailable");

    let key = CalendarKey {
        professional_id: c.pid,
        location_id: c.lid,
    };
    assert!(c.engine.calendar(&key).unwrap().read().await.appointments.is_empty());
    assert!(c.engine.pending_notifications(MAX_NOTIFICATION_BATCH).is_empty());
    assert_eq!(c.slot_starts(Some(c.ct)).await.len(), 6);
    assert!(feed.try_recv().is_err());
}
