//! Appointment lifecycle: booking against a slot, the confirmation /
//! service / completion path, cancellation, reschedule, and no-show.
//!
//! Every mutation follows the same shape: validate under the record's
//! write lock, append one journal event, apply via the shared helper,
//! then notify. Cutoff checks take an explicit `now` in the `_at`
//! variants so tests and the reaper control the clock.

use chrono::NaiveDateTime;
use rand::Rng;
use ulid::Ulid;

use super::{Scheduler, SchedulerError, record_op};
use crate::limits;
use crate::model::{
    Actor, AppointmentState, AppointmentStatus, ConfirmationMethod, Event, ServiceItem,
};
use crate::notify::NotificationKind;
use crate::observability;
use crate::pricing;

/// Anyone party to the appointment, plus admins and the system.
fn authorize(actor: Actor, appointment: &AppointmentState) -> Result<(), SchedulerError> {
    match actor {
        Actor::Customer(id) if id == appointment.customer_id => Ok(()),
        Actor::Provider(id) if id == appointment.provider_id => Ok(()),
        Actor::Admin(_) | Actor::System => Ok(()),
        _ => Err(SchedulerError::Forbidden("not a party to this appointment")),
    }
}

/// Service-side transitions (start, no-show) are never the customer's.
fn authorize_provider_side(
    actor: Actor,
    appointment: &AppointmentState,
) -> Result<(), SchedulerError> {
    match actor {
        Actor::Provider(id) if id == appointment.provider_id => Ok(()),
        Actor::Admin(_) | Actor::System => Ok(()),
        _ => Err(SchedulerError::Forbidden("provider-side transition")),
    }
}

fn check_transition(
    appointment: &AppointmentState,
    to: AppointmentStatus,
) -> Result<(), SchedulerError> {
    if appointment.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(SchedulerError::InvalidTransition {
            from: appointment.status,
            to,
        })
    }
}

fn validate_services(services: &[ServiceItem]) -> Result<(), SchedulerError> {
    if services.is_empty() {
        return Err(SchedulerError::Validation("no services requested"));
    }
    if services.len() > limits::MAX_SERVICES_PER_APPOINTMENT {
        return Err(SchedulerError::LimitExceeded("services per appointment"));
    }
    for item in services {
        if item.name.is_empty() || item.name.len() > limits::MAX_NAME_LEN {
            return Err(SchedulerError::Validation("service name length"));
        }
        if item.quantity == 0 || item.quantity > limits::MAX_SERVICE_QUANTITY {
            return Err(SchedulerError::Validation("service quantity out of range"));
        }
        if item.unit_price_cents < 0 {
            return Err(SchedulerError::Validation("negative unit price"));
        }
    }
    Ok(())
}

fn confirmation_code() -> String {
    // No 0/O/1/I, the code gets read over the phone.
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

impl Scheduler {
    /// Reserve one seat on a slot and open a pending appointment.
    pub async fn book_appointment(
        &self,
        customer_id: Ulid,
        slot_id: Ulid,
        services: Vec<ServiceItem>,
    ) -> Result<Ulid, SchedulerError> {
        let result = self.book_inner(customer_id, slot_id, services).await;
        record_op("book_appointment", &result);
        result
    }

    async fn book_inner(
        &self,
        customer_id: Ulid,
        slot_id: Ulid,
        services: Vec<ServiceItem>,
    ) -> Result<Ulid, SchedulerError> {
        validate_services(&services)?;
        let slot_arc = self
            .get_slot(&slot_id)
            .ok_or(SchedulerError::NotFound(slot_id))?;

        let mut slot = slot_arc.write().await;
        let provider = self
            .get_provider(&slot.provider_id)
            .ok_or(SchedulerError::NotFound(slot.provider_id))?;

        let at = super::now();
        if slot.start_at() <= at {
            return Err(SchedulerError::Validation("slot already started"));
        }
        if slot.has_active_booking_for(customer_id) {
            return Err(SchedulerError::DuplicateBooking {
                customer_id,
                slot_id,
            });
        }
        // The capacity predicate, evaluated under the write guard that
        // will also apply the reservation.
        if !slot.can_accept(1) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(SchedulerError::SlotFull(slot_id));
        }

        let id = Ulid::new();
        let number = self.claim_number(slot.date, id)?;
        let estimate =
            pricing::estimate_cost(&services, slot.slot_type, &provider, self.config.tax_rate_bps);

        let event = Event::AppointmentBooked {
            id,
            number: number.clone(),
            customer_id,
            provider_id: slot.provider_id,
            slot_id,
            date: slot.date,
            start_time: slot.start_time,
            end_time: slot.end_time,
            services: services.clone(),
            estimate,
            at,
        };
        if let Err(e) = self.journal_append(&event).await {
            self.appointment_numbers.remove(&number);
            return Err(e);
        }

        let appointment = super::new_appointment(
            id,
            number.clone(),
            customer_id,
            slot.provider_id,
            slot_id,
            slot.date,
            slot.start_time,
            slot.end_time,
            services,
            estimate,
            at,
        );
        super::apply_reserve(&mut slot, &appointment, at);
        self.notify_appointment(
            NotificationKind::AppointmentBooked,
            &appointment,
            &format!("{number} booked, awaiting confirmation"),
        );
        self.insert_appointment(appointment);
        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        metrics::gauge!(observability::APPOINTMENTS_OPEN).increment(1.0);
        tracing::debug!(%id, %number, %slot_id, "appointment booked");
        Ok(id)
    }

    /// Pick an unused `APT-YYYYMMDD-XXXX` number and claim it so a racing
    /// booking can't draw the same one before we commit.
    fn claim_number(
        &self,
        date: chrono::NaiveDate,
        appointment_id: Ulid,
    ) -> Result<String, SchedulerError> {
        let mut rng = rand::thread_rng();
        for _ in 0..limits::MAX_NUMBER_ATTEMPTS {
            let number = format!("APT-{}-{:04}", date.format("%Y%m%d"), rng.gen_range(0..10_000u32));
            if let dashmap::mapref::entry::Entry::Vacant(e) =
                self.appointment_numbers.entry(number.clone())
            {
                e.insert(appointment_id);
                return Ok(number);
            }
        }
        Err(SchedulerError::LimitExceeded("appointment number attempts"))
    }

    /// Pending (or rescheduled) → confirmed, with a fresh confirmation code.
    pub async fn confirm_appointment(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        method: ConfirmationMethod,
    ) -> Result<String, SchedulerError> {
        let result = self.confirm_inner(actor, appointment_id, method).await;
        record_op("confirm_appointment", &result);
        result
    }

    async fn confirm_inner(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        method: ConfirmationMethod,
    ) -> Result<String, SchedulerError> {
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize(actor, &appointment)?;
        check_transition(&appointment, AppointmentStatus::Confirmed)?;

        let code = confirmation_code();
        let at = super::now();
        self.journal_append(&Event::AppointmentConfirmed {
            id: appointment_id,
            actor,
            method,
            code: code.clone(),
            at,
        })
        .await?;
        super::apply_confirm(&mut appointment, actor, method, code.clone(), at);
        self.notify_appointment(
            NotificationKind::AppointmentConfirmed,
            &appointment,
            &format!("{} confirmed, code {code}", appointment.number),
        );
        Ok(code)
    }

    /// Confirmed → in progress: the provider has the garments in hand.
    pub async fn start_appointment(
        &self,
        actor: Actor,
        appointment_id: Ulid,
    ) -> Result<(), SchedulerError> {
        let result = self.start_inner(actor, appointment_id).await;
        record_op("start_appointment", &result);
        result
    }

    async fn start_inner(&self, actor: Actor, appointment_id: Ulid) -> Result<(), SchedulerError> {
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize_provider_side(actor, &appointment)?;
        check_transition(&appointment, AppointmentStatus::InProgress)?;

        let at = super::now();
        self.journal_append(&Event::AppointmentStarted {
            id: appointment_id,
            actor,
            at,
        })
        .await?;
        appointment.transition(AppointmentStatus::InProgress, at, actor, None);
        self.notify_appointment(
            NotificationKind::AppointmentStarted,
            &appointment,
            &format!("{} is in progress", appointment.number),
        );
        Ok(())
    }

    /// Terminal success. The seat is not given back; the slot's time has
    /// been used.
    pub async fn complete_appointment(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        notes: Option<String>,
    ) -> Result<(), SchedulerError> {
        let result = self.complete_inner(actor, appointment_id, notes).await;
        record_op("complete_appointment", &result);
        result
    }

    async fn complete_inner(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        notes: Option<String>,
    ) -> Result<(), SchedulerError> {
        if let Some(notes) = &notes
            && notes.len() > limits::MAX_REASON_LEN
        {
            return Err(SchedulerError::Validation("notes too long"));
        }
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize_provider_side(actor, &appointment)?;
        check_transition(&appointment, AppointmentStatus::Completed)?;

        let at = super::now();
        self.journal_append(&Event::AppointmentCompleted {
            id: appointment_id,
            actor,
            notes: notes.clone(),
            at,
        })
        .await?;
        super::apply_complete(&mut appointment, actor, notes, at);
        self.notify_appointment(
            NotificationKind::AppointmentCompleted,
            &appointment,
            &format!("{} completed", appointment.number),
        );
        metrics::gauge!(observability::APPOINTMENTS_OPEN).decrement(1.0);
        Ok(())
    }

    /// Cancel and give the seat back. Customers are held to the cutoff;
    /// providers, admins and the system may cancel at any time.
    pub async fn cancel_appointment(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        reason: Option<String>,
        refund_requested: bool,
    ) -> Result<(), SchedulerError> {
        self.cancel_appointment_at(actor, appointment_id, reason, refund_requested, super::now())
            .await
    }

    pub async fn cancel_appointment_at(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        reason: Option<String>,
        refund_requested: bool,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let result = self
            .cancel_inner(actor, appointment_id, reason, refund_requested, now)
            .await;
        record_op("cancel_appointment", &result);
        result
    }

    async fn cancel_inner(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        reason: Option<String>,
        refund_requested: bool,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        if let Some(reason) = &reason
            && reason.len() > limits::MAX_REASON_LEN
        {
            return Err(SchedulerError::Validation("reason too long"));
        }
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize(actor, &appointment)?;
        if !appointment.status.is_cancellable() {
            return Err(SchedulerError::NotCancellable("appointment is not open"));
        }
        if matches!(actor, Actor::Customer(_))
            && appointment.minutes_until_start(now) < self.config.cancel_cutoff_minutes
        {
            return Err(SchedulerError::NotCancellable("inside the cancellation cutoff"));
        }

        // Appointment lock first, then its slot. Every multi-record path
        // orders locks this way.
        let slot_arc = self
            .get_slot(&appointment.slot_id)
            .ok_or(SchedulerError::NotFound(appointment.slot_id))?;
        let mut slot = slot_arc.write().await;

        self.journal_append(&Event::AppointmentCancelled {
            id: appointment_id,
            actor,
            reason: reason.clone(),
            refund_requested,
            at: now,
        })
        .await?;
        super::apply_cancel(
            &mut appointment,
            Some(&mut slot),
            actor,
            reason,
            refund_requested,
            now,
        );
        self.notify_appointment(
            NotificationKind::AppointmentCancelled,
            &appointment,
            &format!("{} cancelled", appointment.number),
        );
        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        metrics::gauge!(observability::APPOINTMENTS_OPEN).decrement(1.0);
        Ok(())
    }

    /// Move a booking to another slot of the same provider. The new seat
    /// is verified before the old one is released, under both slot locks,
    /// so failure leaves the original booking untouched.
    pub async fn reschedule_appointment(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        new_slot_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        self.reschedule_appointment_at(actor, appointment_id, new_slot_id, reason, super::now())
            .await
    }

    pub async fn reschedule_appointment_at(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        new_slot_id: Ulid,
        reason: Option<String>,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let result = self
            .reschedule_inner(actor, appointment_id, new_slot_id, reason, now)
            .await;
        record_op("reschedule_appointment", &result);
        result
    }

    async fn reschedule_inner(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        new_slot_id: Ulid,
        reason: Option<String>,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        if let Some(reason) = &reason
            && reason.len() > limits::MAX_REASON_LEN
        {
            return Err(SchedulerError::Validation("reason too long"));
        }
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize(actor, &appointment)?;
        if !appointment.status.is_reschedulable() {
            return Err(SchedulerError::NotReschedulable("appointment is not open"));
        }
        if matches!(actor, Actor::Customer(_))
            && appointment.minutes_until_start(now) < self.config.reschedule_cutoff_minutes
        {
            return Err(SchedulerError::NotReschedulable("inside the reschedule cutoff"));
        }
        let old_slot_id = appointment.slot_id;
        if new_slot_id == old_slot_id {
            return Err(SchedulerError::Validation("already booked on that slot"));
        }

        let old_arc = self
            .get_slot(&old_slot_id)
            .ok_or(SchedulerError::NotFound(old_slot_id))?;
        let new_arc = self
            .get_slot(&new_slot_id)
            .ok_or(SchedulerError::NotFound(new_slot_id))?;

        // Both slot locks, id-ordered so two crossing reschedules can't
        // deadlock.
        let (mut old_slot, mut new_slot) = if old_slot_id < new_slot_id {
            let old = old_arc.write().await;
            let new = new_arc.write().await;
            (old, new)
        } else {
            let new = new_arc.write().await;
            let old = old_arc.write().await;
            (old, new)
        };

        if new_slot.provider_id != appointment.provider_id {
            return Err(SchedulerError::Validation("slot belongs to another provider"));
        }
        if new_slot.start_at() <= now {
            return Err(SchedulerError::Validation("new slot already started"));
        }
        if new_slot.has_active_booking_for(appointment.customer_id) {
            return Err(SchedulerError::DuplicateBooking {
                customer_id: appointment.customer_id,
                slot_id: new_slot_id,
            });
        }
        // New seat first. Only once it is certain do we let go of the old
        // one; a full target leaves the booking exactly where it was.
        if !new_slot.can_accept(1) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(SchedulerError::SlotFull(new_slot_id));
        }

        self.journal_append(&Event::AppointmentRescheduled {
            id: appointment_id,
            old_slot_id,
            new_slot_id,
            date: new_slot.date,
            start_time: new_slot.start_time,
            end_time: new_slot.end_time,
            actor,
            reason: reason.clone(),
            at: now,
        })
        .await?;
        let (date, start_time, end_time) = (new_slot.date, new_slot.start_time, new_slot.end_time);
        super::apply_reschedule(
            &mut appointment,
            &mut old_slot,
            &mut new_slot,
            date,
            start_time,
            end_time,
            actor,
            reason,
            now,
        );
        self.notify_appointment(
            NotificationKind::AppointmentRescheduled,
            &appointment,
            &format!("{} moved to {date} {start_time}", appointment.number),
        );
        metrics::counter!(observability::RESCHEDULES_TOTAL).increment(1);
        Ok(())
    }

    /// Confirmed appointment whose customer never showed. The seat stays
    /// consumed.
    pub async fn mark_no_show(
        &self,
        actor: Actor,
        appointment_id: Ulid,
    ) -> Result<(), SchedulerError> {
        self.mark_no_show_at(actor, appointment_id, super::now()).await
    }

    pub async fn mark_no_show_at(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let result = self.no_show_inner(actor, appointment_id, now).await;
        record_op("mark_no_show", &result);
        result
    }

    async fn no_show_inner(
        &self,
        actor: Actor,
        appointment_id: Ulid,
        now: NaiveDateTime,
    ) -> Result<(), SchedulerError> {
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        authorize_provider_side(actor, &appointment)?;
        check_transition(&appointment, AppointmentStatus::NoShow)?;
        if appointment.minutes_until_start(now) > -self.config.no_show_grace_minutes {
            return Err(SchedulerError::Validation("no-show grace period not elapsed"));
        }

        self.journal_append(&Event::AppointmentNoShow {
            id: appointment_id,
            actor,
            at: now,
        })
        .await?;
        appointment.transition(AppointmentStatus::NoShow, now, actor, None);
        self.notify_appointment(
            NotificationKind::AppointmentNoShow,
            &appointment,
            &format!("{} marked as no-show", appointment.number),
        );
        metrics::gauge!(observability::APPOINTMENTS_OPEN).decrement(1.0);
        Ok(())
    }

    /// Attach the order created for a completed appointment.
    pub async fn link_order(
        &self,
        appointment_id: Ulid,
        order_id: Ulid,
    ) -> Result<(), SchedulerError> {
        let arc = self
            .get_appointment(&appointment_id)
            .ok_or(SchedulerError::NotFound(appointment_id))?;
        let mut appointment = arc.write().await;
        self.journal_append(&Event::OrderLinked {
            id: appointment_id,
            order_id,
        })
        .await?;
        appointment.order_id = Some(order_id);
        Ok(())
    }
}
