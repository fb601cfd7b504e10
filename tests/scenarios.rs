//! End-to-end flows through the public scheduler API, journal and
//! notification hub included.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use slotwise::config::SchedulerConfig;
use slotwise::model::*;
use slotwise::notify::{NotificationKind, NotifyHub};
use slotwise::recurrence::SlotTemplate;
use slotwise::scheduler::{Scheduler, SchedulerError};

fn journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotwise_test_scenarios");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.journal"));
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap()
}

fn d(day: u32) -> NaiveDate {
    // 2030-06-10 is a Monday.
    NaiveDate::from_ymd_opt(2030, 6, day).unwrap()
}

fn services() -> Vec<ServiceItem> {
    vec![ServiceItem {
        service_id: Ulid::new(),
        name: "two-piece suit".into(),
        quantity: 1,
        unit_price_cents: 1_500,
    }]
}

async fn setup(name: &str) -> (Arc<Scheduler>, Arc<NotifyHub>, Ulid) {
    let hub = Arc::new(NotifyHub::new());
    let scheduler = Arc::new(
        Scheduler::new(journal_path(name), hub.clone(), SchedulerConfig::default()).unwrap(),
    );
    let provider_id = Ulid::new();
    scheduler
        .register_provider(ProviderProfile {
            id: provider_id,
            name: "Crisp & Go".into(),
            delivery_fee_cents: 300,
            free_delivery_over_cents: Some(5_000),
        })
        .await
        .unwrap();
    (scheduler, hub, provider_id)
}

async fn make_slot(
    scheduler: &Scheduler,
    provider_id: Ulid,
    day: u32,
    hour: u32,
    cap: u32,
) -> Ulid {
    scheduler
        .create_slot(
            Actor::Provider(provider_id),
            provider_id,
            d(day),
            t(hour),
            t(hour + 2),
            SlotType::Regular,
            cap,
            None,
        )
        .await
        .unwrap()
}

async fn slot_snapshot(scheduler: &Scheduler, id: Ulid) -> SlotState {
    scheduler.get_slot(&id).unwrap().read().await.clone()
}

#[tokio::test]
async fn capacity_two_slot_fills_on_second_booking() {
    let (s, _hub, provider) = setup("fills_on_second").await;
    let slot = make_slot(&s, provider, 10, 9, 2).await;

    s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
    assert_eq!(slot_snapshot(&s, slot).await.status, SlotStatus::Available);

    s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
    assert_eq!(slot_snapshot(&s, slot).await.status, SlotStatus::Full);

    let err = s
        .book_appointment(Ulid::new(), slot, services())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SlotFull(_)));
    assert_eq!(err.kind(), slotwise::scheduler::ErrorKind::Conflict);
}

#[tokio::test]
async fn cancellation_reopens_a_full_slot() {
    let (s, _hub, provider) = setup("reopens_after_cancel").await;
    let slot = make_slot(&s, provider, 10, 9, 2).await;
    let first_customer = Ulid::new();
    let first = s.book_appointment(first_customer, slot, services()).await.unwrap();
    s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
    assert_eq!(slot_snapshot(&s, slot).await.status, SlotStatus::Full);

    let day_before = d(9).and_time(t(9));
    s.cancel_appointment_at(Actor::Customer(first_customer), first, None, false, day_before)
        .await
        .unwrap();
    assert_eq!(slot_snapshot(&s, slot).await.status, SlotStatus::Available);

    // The freed seat is immediately bookable by a third customer.
    s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
    assert_eq!(slot_snapshot(&s, slot).await.status, SlotStatus::Full);
}

#[tokio::test]
async fn confirmed_appointment_moves_between_single_seat_slots() {
    let (s, _hub, provider) = setup("single_seat_move").await;
    let slot_a = make_slot(&s, provider, 10, 9, 1).await;
    let slot_b = make_slot(&s, provider, 11, 9, 1).await;
    let customer = Ulid::new();

    let id = s.book_appointment(customer, slot_a, services()).await.unwrap();
    s.confirm_appointment(Actor::Provider(provider), id, ConfirmationMethod::App)
        .await
        .unwrap();

    let week_before = d(3).and_time(t(9));
    s.reschedule_appointment_at(Actor::Customer(customer), id, slot_b, None, week_before)
        .await
        .unwrap();

    assert_eq!(slot_snapshot(&s, slot_a).await.current_bookings, 0);
    assert_eq!(slot_snapshot(&s, slot_b).await.current_bookings, 1);
    let appointment = s.get_appointment(&id).unwrap().read().await.clone();
    assert_eq!(appointment.slot_id, slot_b);
    assert_eq!(appointment.status, AppointmentStatus::Rescheduled);
}

#[tokio::test]
async fn late_cancellation_is_a_conflict() {
    let (s, _hub, provider) = setup("late_cancel").await;
    let slot = make_slot(&s, provider, 10, 9, 2).await;
    let customer = Ulid::new();
    let id = s.book_appointment(customer, slot, services()).await.unwrap();

    let half_hour_before = d(10).and_time(t(9)) - Duration::minutes(30);
    let err = s
        .cancel_appointment_at(Actor::Customer(customer), id, None, false, half_hour_before)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NotCancellable(_)));
    assert_eq!(err.kind(), slotwise::scheduler::ErrorKind::Conflict);
    assert_eq!(slot_snapshot(&s, slot).await.current_bookings, 1);
}

#[tokio::test]
async fn weekly_bulk_generation_skips_existing_days() {
    let (s, _hub, provider) = setup("weekly_bulk").await;
    let template = SlotTemplate {
        start_time: t(9),
        end_time: t(11),
        capacity: 2,
        slot_type: SlotType::Regular,
    };

    // Mon Jun 10 .. Sun Jun 16, Mondays and Wednesdays only: exactly two
    // slot-days come out of a seven-day range.
    let outcome = s
        .bulk_create_slots(
            Actor::Provider(provider),
            provider,
            &template,
            d(10),
            d(16),
            Some(&[Weekday::Mon, Weekday::Wed]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.skipped_existing, 0);
    assert_eq!(outcome.failed, 0);

    let monday = slot_snapshot(&s, outcome.created[0]).await;
    assert_eq!(monday.date, d(10));
    let wednesday = slot_snapshot(&s, outcome.created[1]).await;
    assert_eq!(wednesday.date, d(12));
    let meta = wednesday.recurrence.unwrap();
    assert_eq!(meta.frequency, RecurrenceFrequency::Weekly);
    assert_eq!(meta.until, d(16));

    // Re-running the same template is a no-op, not a duplicate pile-up.
    let rerun = s
        .bulk_create_slots(
            Actor::Provider(provider),
            provider,
            &template,
            d(10),
            d(16),
            Some(&[Weekday::Mon, Weekday::Wed]),
            None,
        )
        .await
        .unwrap();
    assert!(rerun.created.is_empty());
    assert_eq!(rerun.skipped_existing, 2);
    assert_eq!(s.list_provider_slots(provider).await.len(), 2);
}

#[tokio::test]
async fn slot_deletion_waits_for_bookings_to_clear() {
    let (s, _hub, provider) = setup("delete_after_clear").await;
    let slot = make_slot(&s, provider, 10, 9, 2).await;
    let customer = Ulid::new();
    let id = s.book_appointment(customer, slot, services()).await.unwrap();

    let err = s.delete_slot(Actor::Provider(provider), slot).await.unwrap_err();
    assert!(matches!(err, SchedulerError::HasBookings(_)));
    assert_eq!(err.kind(), slotwise::scheduler::ErrorKind::Conflict);

    let day_before = d(9).and_time(t(9));
    s.cancel_appointment_at(Actor::Customer(customer), id, None, false, day_before)
        .await
        .unwrap();
    s.delete_slot(Actor::Provider(provider), slot).await.unwrap();
    assert!(s.get_slot(&slot).is_none());
}

#[tokio::test]
async fn notifications_follow_the_booking_flow() {
    let (s, hub, provider) = setup("notification_flow").await;
    let mut rx = hub.subscribe(provider);
    let slot = make_slot(&s, provider, 10, 9, 2).await;
    let id = s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
    s.confirm_appointment(Actor::Provider(provider), id, ConfirmationMethod::Sms)
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::SlotCreated);
    let booked = rx.recv().await.unwrap();
    assert_eq!(booked.kind, NotificationKind::AppointmentBooked);
    assert_eq!(booked.appointment_id, Some(id));
    assert_eq!(
        rx.recv().await.unwrap().kind,
        NotificationKind::AppointmentConfirmed
    );
}

#[tokio::test]
async fn restart_replays_a_full_working_day() {
    let path = journal_path("restart_working_day");
    let hub = Arc::new(NotifyHub::new());
    let provider = Ulid::new();
    let customer = Ulid::new();

    let (slot, completed, cancelled) = {
        let s = Arc::new(
            Scheduler::new(path.clone(), hub.clone(), SchedulerConfig::default()).unwrap(),
        );
        s.register_provider(ProviderProfile {
            id: provider,
            name: "Crisp & Go".into(),
            delivery_fee_cents: 300,
            free_delivery_over_cents: None,
        })
        .await
        .unwrap();
        let slot = make_slot(&s, provider, 10, 9, 3).await;

        let completed = s.book_appointment(customer, slot, services()).await.unwrap();
        s.confirm_appointment(Actor::Provider(provider), completed, ConfirmationMethod::Phone)
            .await
            .unwrap();
        s.start_appointment(Actor::Provider(provider), completed).await.unwrap();
        s.complete_appointment(Actor::Provider(provider), completed, None)
            .await
            .unwrap();
        s.link_order(completed, Ulid::new()).await.unwrap();

        let cancelled = s.book_appointment(Ulid::new(), slot, services()).await.unwrap();
        s.cancel_appointment_at(Actor::Admin(Ulid::new()), cancelled, None, false, d(9).and_time(t(9)))
            .await
            .unwrap();
        (slot, completed, cancelled)
    };

    let reopened = Arc::new(
        Scheduler::new(path, hub, SchedulerConfig::default()).unwrap(),
    );
    let slot_state = reopened.get_slot(&slot).unwrap().read().await.clone();
    // Completed seat stays consumed, cancelled seat was given back.
    assert_eq!(slot_state.current_bookings, 1);
    assert_eq!(slot_state.bookings.len(), 2);

    let done = reopened.get_appointment(&completed).unwrap().read().await.clone();
    assert_eq!(done.status, AppointmentStatus::Completed);
    assert!(done.order_id.is_some());
    assert!(done.confirmation.is_some());

    let gone = reopened.get_appointment(&cancelled).unwrap().read().await.clone();
    assert_eq!(gone.status, AppointmentStatus::Cancelled);

    let stats = reopened.appointment_stats(Some(provider)).await;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);
}
