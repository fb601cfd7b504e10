//! Slot lifecycle: create, resize, block, delete, and bulk generation
//! from a recurrence template.

use chrono::{NaiveDate, NaiveTime, Weekday};
use ulid::Ulid;

use super::{Scheduler, SchedulerError, record_op};
use crate::limits;
use crate::model::{
    Actor, BulkCreateOutcome, Event, RecurrenceMeta, SlotStatus, SlotType,
};
use crate::notify::NotificationKind;
use crate::recurrence::{self, SlotTemplate};

/// Slot management is the owning provider's privilege; admins and the
/// system (reaper, compactor) act on anyone's slots.
fn authorize(actor: Actor, provider_id: Ulid) -> Result<(), SchedulerError> {
    match actor {
        Actor::Provider(id) if id == provider_id => Ok(()),
        Actor::Admin(_) | Actor::System => Ok(()),
        _ => Err(SchedulerError::Forbidden("not the slot's provider")),
    }
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_slot(
        &self,
        actor: Actor,
        provider_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        slot_type: SlotType,
        capacity: u32,
        recurrence: Option<RecurrenceMeta>,
    ) -> Result<Ulid, SchedulerError> {
        let result = self
            .create_slot_inner(
                actor, provider_id, date, start_time, end_time, slot_type, capacity,
                recurrence,
            )
            .await;
        record_op("create_slot", &result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_slot_inner(
        &self,
        actor: Actor,
        provider_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        slot_type: SlotType,
        capacity: u32,
        recurrence: Option<RecurrenceMeta>,
    ) -> Result<Ulid, SchedulerError> {
        authorize(actor, provider_id)?;
        if self.get_provider(&provider_id).is_none() {
            return Err(SchedulerError::NotFound(provider_id));
        }
        if end_time <= start_time {
            return Err(SchedulerError::Validation("end time must be after start time"));
        }
        if capacity == 0 || capacity > limits::MAX_SLOT_CAPACITY {
            return Err(SchedulerError::Validation("capacity out of range"));
        }
        if self.provider_slot_count(&provider_id) >= limits::MAX_SLOTS_PER_PROVIDER {
            return Err(SchedulerError::LimitExceeded("slots per provider"));
        }

        let id = Ulid::new();
        let key = (provider_id, date, start_time);
        // Claim the uniqueness key before journaling so two concurrent
        // creates of the same (provider, date, start) can't both commit.
        match self.slot_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SchedulerError::DuplicateSlot {
                    provider_id,
                    date,
                    start_time,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(id);
            }
        }

        let at = super::now();
        let event = Event::SlotCreated {
            id,
            provider_id,
            date,
            start_time,
            end_time,
            slot_type,
            capacity,
            recurrence,
            actor,
            at,
        };
        if let Err(e) = self.journal_append(&event).await {
            self.slot_index.remove(&key);
            return Err(e);
        }

        let slot = super::new_slot(
            id, provider_id, date, start_time, end_time, slot_type, capacity, recurrence,
            actor, at,
        );
        self.notify_slot(
            NotificationKind::SlotCreated,
            &slot,
            &format!("new {date} {start_time} slot open for booking"),
        );
        self.insert_slot(slot);
        tracing::debug!(%id, %provider_id, %date, "slot created");
        Ok(id)
    }

    /// Resize a slot. Shrinking below the number of active bookings is
    /// rejected; release or move those bookings first.
    pub async fn update_capacity(
        &self,
        actor: Actor,
        slot_id: Ulid,
        capacity: u32,
    ) -> Result<(), SchedulerError> {
        let result = self.update_capacity_inner(actor, slot_id, capacity).await;
        record_op("update_capacity", &result);
        result
    }

    async fn update_capacity_inner(
        &self,
        actor: Actor,
        slot_id: Ulid,
        capacity: u32,
    ) -> Result<(), SchedulerError> {
        if capacity == 0 || capacity > limits::MAX_SLOT_CAPACITY {
            return Err(SchedulerError::Validation("capacity out of range"));
        }
        let arc = self
            .get_slot(&slot_id)
            .ok_or(SchedulerError::NotFound(slot_id))?;
        let mut slot = arc.write().await;
        authorize(actor, slot.provider_id)?;
        if capacity < slot.current_bookings {
            return Err(SchedulerError::Validation("capacity below active bookings"));
        }
        if capacity == slot.max_capacity {
            return Ok(());
        }

        let at = super::now();
        self.journal_append(&Event::SlotCapacityChanged {
            id: slot_id,
            capacity,
            actor,
            at,
        })
        .await?;
        super::apply_capacity_change(&mut slot, capacity, actor, at);
        Ok(())
    }

    /// Block or unblock a slot. Blocking keeps existing bookings in place
    /// but stops new reservations; unblocking re-derives Available/Full
    /// from the counter.
    pub async fn toggle_block(
        &self,
        actor: Actor,
        slot_id: Ulid,
        blocked: bool,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        let result = self.toggle_block_inner(actor, slot_id, blocked, reason).await;
        record_op("toggle_block", &result);
        result
    }

    async fn toggle_block_inner(
        &self,
        actor: Actor,
        slot_id: Ulid,
        blocked: bool,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        if let Some(reason) = &reason
            && reason.len() > limits::MAX_REASON_LEN
        {
            return Err(SchedulerError::Validation("reason too long"));
        }
        let arc = self
            .get_slot(&slot_id)
            .ok_or(SchedulerError::NotFound(slot_id))?;
        let mut slot = arc.write().await;
        authorize(actor, slot.provider_id)?;
        if blocked == (slot.status == SlotStatus::Blocked) {
            return Ok(());
        }

        let at = super::now();
        self.journal_append(&Event::SlotBlockToggled {
            id: slot_id,
            blocked,
            reason: reason.clone(),
            actor,
            at,
        })
        .await?;
        super::apply_block_toggle(&mut slot, blocked, reason, actor, at);
        let kind = if blocked {
            NotificationKind::SlotBlocked
        } else {
            NotificationKind::SlotUnblocked
        };
        let message = if blocked {
            format!("slot on {} at {} is no longer bookable", slot.date, slot.start_time)
        } else {
            format!("slot on {} at {} is open again", slot.date, slot.start_time)
        };
        self.notify_slot(kind, &slot, &message);
        Ok(())
    }

    /// Remove a slot with no active bookings. The slot is closed under its
    /// write lock before the maps are touched, so a racing reservation
    /// that already holds the Arc fails the capacity predicate.
    pub async fn delete_slot(&self, actor: Actor, slot_id: Ulid) -> Result<(), SchedulerError> {
        let result = self.delete_slot_inner(actor, slot_id).await;
        record_op("delete_slot", &result);
        result
    }

    async fn delete_slot_inner(&self, actor: Actor, slot_id: Ulid) -> Result<(), SchedulerError> {
        let arc = self
            .get_slot(&slot_id)
            .ok_or(SchedulerError::NotFound(slot_id))?;
        let mut slot = arc.write().await;
        authorize(actor, slot.provider_id)?;
        if slot.current_bookings > 0 {
            return Err(SchedulerError::HasBookings(slot_id));
        }

        self.journal_append(&Event::SlotDeleted { id: slot_id }).await?;
        slot.status = SlotStatus::Closed;
        let key = slot.key();
        let provider_id = slot.provider_id;
        drop(slot);

        self.slots.remove(&slot_id);
        self.slot_index.remove(&key);
        if let Some(mut ids) = self.provider_slots.get_mut(&provider_id) {
            ids.retain(|s| *s != slot_id);
        }
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
        tracing::debug!(%slot_id, %provider_id, "slot deleted");
        Ok(())
    }

    /// Stamp a template across a date range, one slot per matching day.
    /// Best-effort: days whose slot already exists are skipped, other
    /// per-day failures are counted and the run continues.
    #[allow(clippy::too_many_arguments)]
    pub async fn bulk_create_slots(
        &self,
        actor: Actor,
        provider_id: Ulid,
        template: &SlotTemplate,
        from: NaiveDate,
        until: NaiveDate,
        days_of_week: Option<&[Weekday]>,
        parent_slot_id: Option<Ulid>,
    ) -> Result<BulkCreateOutcome, SchedulerError> {
        let result = self
            .bulk_create_inner(
                actor, provider_id, template, from, until, days_of_week, parent_slot_id,
            )
            .await;
        record_op("bulk_create_slots", &result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn bulk_create_inner(
        &self,
        actor: Actor,
        provider_id: Ulid,
        template: &SlotTemplate,
        from: NaiveDate,
        until: NaiveDate,
        days_of_week: Option<&[Weekday]>,
        parent_slot_id: Option<Ulid>,
    ) -> Result<BulkCreateOutcome, SchedulerError> {
        authorize(actor, provider_id)?;
        if until < from {
            return Err(SchedulerError::Validation("date range inverted"));
        }
        if (until - from).num_days() >= limits::MAX_BULK_RANGE_DAYS {
            return Err(SchedulerError::LimitExceeded("bulk creation range"));
        }

        let mut outcome = BulkCreateOutcome::default();
        for spec in recurrence::expand(
            provider_id,
            template,
            from,
            until,
            days_of_week,
            parent_slot_id,
        ) {
            match self
                .create_slot(
                    actor,
                    spec.provider_id,
                    spec.date,
                    spec.start_time,
                    spec.end_time,
                    spec.slot_type,
                    spec.capacity,
                    Some(spec.recurrence),
                )
                .await
            {
                Ok(id) => outcome.created.push(id),
                Err(SchedulerError::DuplicateSlot { .. }) => outcome.skipped_existing += 1,
                Err(e) => {
                    tracing::warn!(%provider_id, date = %spec.date, error = %e, "bulk create: day failed");
                    outcome.failed += 1;
                }
            }
        }
        tracing::info!(
            %provider_id,
            created = outcome.created.len(),
            skipped = outcome.skipped_existing,
            failed = outcome.failed,
            "bulk slot creation finished"
        );
        Ok(outcome)
    }
}
