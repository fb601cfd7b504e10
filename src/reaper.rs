//! Background maintenance: sweep appointments whose slot time has come
//! and gone, and rewrite the journal when it grows past the threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::{Actor, AppointmentStatus};
use crate::scheduler::Scheduler;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically expire appointments left behind by inactive parties:
/// never-confirmed bookings are cancelled, confirmed ones whose customer
/// did not appear become no-shows.
pub async fn run_reaper(scheduler: Arc<Scheduler>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        sweep_stale_appointments(&scheduler, crate::scheduler::now()).await;
    }
}

pub async fn sweep_stale_appointments(scheduler: &Scheduler, now: NaiveDateTime) {
    for (id, status) in collect_stale_appointments(scheduler, now).await {
        let result = match status {
            AppointmentStatus::Pending => {
                scheduler
                    .cancel_appointment_at(
                        Actor::System,
                        id,
                        Some("never confirmed".into()),
                        false,
                        now,
                    )
                    .await
            }
            AppointmentStatus::Confirmed => {
                scheduler.mark_no_show_at(Actor::System, id, now).await
            }
            _ => continue,
        };
        match result {
            Ok(()) => tracing::info!(%id, %status, "reaped stale appointment"),
            // Lost a race with a live mutation; next sweep re-evaluates.
            Err(e) => tracing::debug!(%id, error = %e, "reap skipped"),
        }
    }
}

/// Pending and confirmed appointments whose start time plus the no-show
/// grace period is behind `now`. Read-only; the sweep re-validates under
/// write locks.
pub async fn collect_stale_appointments(
    scheduler: &Scheduler,
    now: NaiveDateTime,
) -> Vec<(Ulid, AppointmentStatus)> {
    let grace = scheduler.config.no_show_grace_minutes;
    let mut stale = Vec::new();
    for id in scheduler.appointment_ids() {
        let Some(arc) = scheduler.get_appointment(&id) else { continue };
        let appointment = arc.read().await;
        if !matches!(
            appointment.status,
            AppointmentStatus::Pending | AppointmentStatus::Confirmed
        ) {
            continue;
        }
        if appointment.minutes_until_start(now) <= -grace {
            stale.push((id, appointment.status));
        }
    }
    stale
}

/// Rewrite the journal down to one snapshot per record once enough
/// appends have accumulated.
pub async fn run_compactor(scheduler: Arc<Scheduler>, threshold: u64) {
    let mut ticker = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        let appends = scheduler.journal_appends_since_rewrite().await;
        if appends < threshold {
            continue;
        }
        match scheduler.rewrite_journal().await {
            Ok(()) => tracing::info!(appends, "journal rewritten"),
            Err(e) => tracing::warn!(error = %e, "journal rewrite failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::model::{ProviderProfile, ServiceItem, SlotType};
    use crate::notify::NotifyHub;
    use chrono::{NaiveDate, NaiveTime};

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, day).unwrap()
    }

    async fn setup(name: &str) -> (Arc<Scheduler>, Ulid) {
        let dir = std::env::temp_dir().join("slotwise_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.journal"));
        let _ = std::fs::remove_file(&path);
        let scheduler = Arc::new(
            Scheduler::new(path, Arc::new(NotifyHub::new()), SchedulerConfig::default())
                .unwrap(),
        );
        let provider_id = Ulid::new();
        scheduler
            .register_provider(ProviderProfile {
                id: provider_id,
                name: "Press Express".into(),
                delivery_fee_cents: 0,
                free_delivery_over_cents: None,
            })
            .await
            .unwrap();
        (scheduler, provider_id)
    }

    async fn booked(s: &Scheduler, provider: Ulid, day: u32, hour: u32) -> (Ulid, Ulid) {
        let slot = s
            .create_slot(
                Actor::Provider(provider),
                provider,
                d(day),
                t(hour),
                t(hour + 2),
                SlotType::Regular,
                2,
                None,
            )
            .await
            .unwrap();
        let services = vec![ServiceItem {
            service_id: Ulid::new(),
            name: "bed linen".into(),
            quantity: 2,
            unit_price_cents: 800,
        }];
        let id = s.book_appointment(Ulid::new(), slot, services).await.unwrap();
        (slot, id)
    }

    #[tokio::test]
    async fn sweep_expires_pending_and_marks_confirmed_no_show() {
        let (s, provider) = setup("sweep").await;
        let (pending_slot, pending) = booked(&s, provider, 10, 9).await;
        let (no_show_slot, confirmed) = booked(&s, provider, 10, 14).await;
        s.confirm_appointment(
            Actor::Provider(provider),
            confirmed,
            crate::model::ConfirmationMethod::App,
        )
        .await
        .unwrap();

        // Ten past the later start: inside the 30 minute grace, nothing stale.
        let early = d(10).and_time(NaiveTime::from_hms_opt(14, 10, 0).unwrap());
        assert!(collect_stale_appointments(&s, early).await.is_empty());

        let late = d(10).and_time(t(15));
        sweep_stale_appointments(&s, late).await;

        let p = s.get_appointment(&pending).unwrap().read().await.clone();
        assert_eq!(p.status, AppointmentStatus::Cancelled);
        let c = s.get_appointment(&confirmed).unwrap().read().await.clone();
        assert_eq!(c.status, AppointmentStatus::NoShow);

        // Expiry gives the unconfirmed seat back; the no-show keeps its seat.
        let ps = s.get_slot(&pending_slot).unwrap().read().await.clone();
        assert_eq!(ps.current_bookings, 0);
        let ns = s.get_slot(&no_show_slot).unwrap().read().await.clone();
        assert_eq!(ns.current_bookings, 1);

        // A second sweep finds nothing left to do.
        assert!(collect_stale_appointments(&s, late).await.is_empty());
    }
}
