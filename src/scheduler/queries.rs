//! Read-only views. Queries take read locks and clone snapshots; they
//! never block a mutation for longer than one record copy.

use chrono::NaiveDate;
use ulid::Ulid;

use super::{Scheduler, SchedulerError};
use crate::limits;
use crate::model::{
    AppointmentState, AppointmentStats, AppointmentStatus, SlotFilters, SlotState, SlotStats,
    SlotStatus,
};

fn check_range(from: NaiveDate, until: NaiveDate) -> Result<(), SchedulerError> {
    if until < from {
        return Err(SchedulerError::Validation("date range inverted"));
    }
    if (until - from).num_days() >= limits::MAX_QUERY_RANGE_DAYS {
        return Err(SchedulerError::LimitExceeded("query range"));
    }
    Ok(())
}

impl Scheduler {
    /// Bookable slots for a provider in `[from, until]`, filtered and
    /// sorted by (date, start time). Snapshot semantics: a slot may fill
    /// up between this query and the booking attempt; the booking path
    /// re-checks under the write lock.
    pub async fn find_available_slots(
        &self,
        provider_id: Ulid,
        from: NaiveDate,
        until: NaiveDate,
        filters: &SlotFilters,
    ) -> Result<Vec<SlotState>, SchedulerError> {
        check_range(from, until)?;
        if self.get_provider(&provider_id).is_none() {
            return Err(SchedulerError::NotFound(provider_id));
        }

        let mut out = Vec::new();
        for id in self.slot_ids_for_provider(&provider_id) {
            let Some(arc) = self.get_slot(&id) else { continue };
            let slot = arc.read().await;
            if slot.date < from || slot.date > until {
                continue;
            }
            if slot.status != SlotStatus::Available {
                continue;
            }
            if slot.remaining() < filters.min_remaining.max(1) {
                continue;
            }
            if let Some(t) = filters.slot_type
                && slot.slot_type != t
            {
                continue;
            }
            out.push(slot.clone());
        }
        out.sort_by_key(|s| (s.date, s.start_time));
        Ok(out)
    }

    /// Every slot a provider owns, blocked and full ones included.
    pub async fn list_provider_slots(&self, provider_id: Ulid) -> Vec<SlotState> {
        let mut out = Vec::new();
        for id in self.slot_ids_for_provider(&provider_id) {
            if let Some(arc) = self.get_slot(&id) {
                out.push(arc.read().await.clone());
            }
        }
        out.sort_by_key(|s| (s.date, s.start_time));
        out
    }

    /// A customer's appointments, newest booking first.
    pub async fn list_customer_appointments(&self, customer_id: Ulid) -> Vec<AppointmentState> {
        let mut out = Vec::new();
        for id in self.appointment_ids_for_customer(&customer_id) {
            if let Some(arc) = self.get_appointment(&id) {
                out.push(arc.read().await.clone());
            }
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    /// Utilization roll-up over a provider's slots in `[from, until]`.
    pub async fn slot_stats(
        &self,
        provider_id: Ulid,
        from: NaiveDate,
        until: NaiveDate,
    ) -> Result<SlotStats, SchedulerError> {
        check_range(from, until)?;
        let mut stats = SlotStats::default();
        for id in self.slot_ids_for_provider(&provider_id) {
            let Some(arc) = self.get_slot(&id) else { continue };
            let slot = arc.read().await;
            if slot.date < from || slot.date > until {
                continue;
            }
            stats.total += 1;
            match slot.status {
                SlotStatus::Available => stats.available += 1,
                SlotStatus::Full => stats.full += 1,
                SlotStatus::Blocked => stats.blocked += 1,
                SlotStatus::Closed => {}
            }
            stats.total_capacity += slot.max_capacity;
            stats.total_booked += slot.current_bookings;
        }
        Ok(stats)
    }

    /// Per-status appointment counts, optionally scoped to one provider.
    pub async fn appointment_stats(&self, provider_id: Option<Ulid>) -> AppointmentStats {
        let mut stats = AppointmentStats::default();
        for id in self.appointment_ids() {
            let Some(arc) = self.get_appointment(&id) else { continue };
            let appointment = arc.read().await;
            if let Some(p) = provider_id
                && appointment.provider_id != p
            {
                continue;
            }
            stats.total += 1;
            match appointment.status {
                AppointmentStatus::Pending => stats.pending += 1,
                AppointmentStatus::Confirmed => stats.confirmed += 1,
                AppointmentStatus::InProgress => stats.in_progress += 1,
                AppointmentStatus::Rescheduled => stats.rescheduled += 1,
                AppointmentStatus::Completed => stats.completed += 1,
                AppointmentStatus::Cancelled => stats.cancelled += 1,
                AppointmentStatus::NoShow => stats.no_show += 1,
            }
        }
        stats
    }
}
