mod appointments;
mod error;
mod queries;
mod slots;

pub use error::{ErrorKind, SchedulerError};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotifyHub};

pub type SharedSlot = Arc<RwLock<SlotState>>;
pub type SharedAppointment = Arc<RwLock<AppointmentState>>;

pub(crate) fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

// ── Group-commit journal channel ─────────────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceRewrite {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group
/// commit: buffer the first append, drain everything immediately
/// available, one fsync for the whole batch, then answer every sender.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut journal, &mut batch);
                            handle_non_append(&mut journal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush the batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut journal, &mut batch);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_and_respond(
    journal: &mut Journal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
        .record(batch.len() as f64);
    let start = std::time::Instant::now();
    let result = flush_batch(journal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = journal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always sync, even on append error, so partially buffered bytes
    // from this failed batch don't leak into the next one.
    let sync_err = journal.sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = sync_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Rewrite { events, response } => {
            let result = Journal::write_rewrite_file(journal.path(), &events)
                .and_then(|()| journal.swap_rewrite_file());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceRewrite { response } => {
            let _ = response.send(journal.appends_since_rewrite());
        }
        JournalCommand::Append { .. } => unreachable!(),
    }
}

// ── The scheduler ────────────────────────────────────────────────

/// Reservation core: slots and appointments as two id-linked arenas,
/// secondary indexes, and a durable journal. Any number of requests may
/// run concurrently; each record's `RwLock` write guard is the atomic
/// boundary for its invariants.
pub struct Scheduler {
    pub config: SchedulerConfig,
    providers: DashMap<Ulid, ProviderProfile>,
    slots: DashMap<Ulid, SharedSlot>,
    appointments: DashMap<Ulid, SharedAppointment>,
    /// (provider, date, start) → slot id. Duplicate-slot guard and the
    /// recurrence generator's skip-existing probe.
    slot_index: DashMap<SlotKey, Ulid>,
    provider_slots: DashMap<Ulid, Vec<Ulid>>,
    customer_appointments: DashMap<Ulid, Vec<Ulid>>,
    /// Human-readable appointment numbers must stay unique.
    appointment_numbers: DashMap<String, Ulid>,
    journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Scheduler {
    pub fn new(
        journal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: SchedulerConfig,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let scheduler = Self {
            config,
            providers: DashMap::new(),
            slots: DashMap::new(),
            appointments: DashMap::new(),
            slot_index: DashMap::new(),
            provider_slots: DashMap::new(),
            customer_appointments: DashMap::new(),
            appointment_numbers: DashMap::new(),
            journal_tx,
            notify,
        };

        for event in events {
            scheduler.replay_event(event);
        }

        Ok(scheduler)
    }

    /// Apply one journal event during startup. We are the sole owner of
    /// every Arc here, so try_write always succeeds instantly.
    fn replay_event(&self, event: Event) {
        match event {
            Event::ProviderRegistered { profile } => {
                self.providers.insert(profile.id, profile);
            }
            Event::SlotCreated {
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
            } => {
                let slot = new_slot(
                    id, provider_id, date, start_time, end_time, slot_type, capacity,
                    recurrence, actor, at,
                );
                self.insert_slot(slot);
            }
            Event::SlotSnapshot { slot } => {
                self.insert_slot(slot);
            }
            Event::SlotCapacityChanged {
                id,
                capacity,
                actor,
                at,
            } => {
                if let Some(arc) = self.get_slot(&id) {
                    let mut slot = arc.try_write().expect("replay: uncontended write");
                    apply_capacity_change(&mut slot, capacity, actor, at);
                }
            }
            Event::SlotBlockToggled {
                id,
                blocked,
                reason,
                actor,
                at,
            } => {
                if let Some(arc) = self.get_slot(&id) {
                    let mut slot = arc.try_write().expect("replay: uncontended write");
                    apply_block_toggle(&mut slot, blocked, reason, actor, at);
                }
            }
            Event::SlotDeleted { id } => {
                self.remove_slot(&id);
            }
            Event::AppointmentBooked {
                id,
                number,
                customer_id,
                provider_id,
                slot_id,
                date,
                start_time,
                end_time,
                services,
                estimate,
                at,
            } => {
                if let Some(arc) = self.get_slot(&slot_id) {
                    let mut slot = arc.try_write().expect("replay: uncontended write");
                    let appointment = new_appointment(
                        id, number, customer_id, provider_id, slot_id, date, start_time,
                        end_time, services, estimate, at,
                    );
                    apply_reserve(&mut slot, &appointment, at);
                    self.insert_appointment(appointment);
                }
            }
            Event::AppointmentSnapshot { appointment } => {
                self.insert_appointment(appointment);
            }
            Event::AppointmentConfirmed {
                id,
                actor,
                method,
                code,
                at,
            } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    apply_confirm(&mut appointment, actor, method, code, at);
                }
            }
            Event::AppointmentStarted { id, actor, at } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    appointment.transition(AppointmentStatus::InProgress, at, actor, None);
                }
            }
            Event::AppointmentCompleted {
                id,
                actor,
                notes,
                at,
            } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    apply_complete(&mut appointment, actor, notes, at);
                }
            }
            Event::AppointmentCancelled {
                id,
                actor,
                reason,
                refund_requested,
                at,
            } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    let slot_arc = self.get_slot(&appointment.slot_id);
                    let mut slot = slot_arc
                        .as_ref()
                        .map(|s| s.try_write().expect("replay: uncontended write"));
                    apply_cancel(
                        &mut appointment,
                        slot.as_deref_mut(),
                        actor,
                        reason,
                        refund_requested,
                        at,
                    );
                }
            }
            Event::AppointmentRescheduled {
                id,
                old_slot_id,
                new_slot_id,
                date,
                start_time,
                end_time,
                actor,
                reason,
                at,
            } => {
                let (Some(appt_arc), Some(old_arc), Some(new_arc)) = (
                    self.get_appointment(&id),
                    self.get_slot(&old_slot_id),
                    self.get_slot(&new_slot_id),
                ) else {
                    return;
                };
                let mut appointment = appt_arc.try_write().expect("replay: uncontended write");
                let mut old_slot = old_arc.try_write().expect("replay: uncontended write");
                let mut new_slot = new_arc.try_write().expect("replay: uncontended write");
                apply_reschedule(
                    &mut appointment,
                    &mut old_slot,
                    &mut new_slot,
                    date,
                    start_time,
                    end_time,
                    actor,
                    reason,
                    at,
                );
            }
            Event::AppointmentNoShow { id, actor, at } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    appointment.transition(AppointmentStatus::NoShow, at, actor, None);
                }
            }
            Event::OrderLinked { id, order_id } => {
                if let Some(arc) = self.get_appointment(&id) {
                    let mut appointment = arc.try_write().expect("replay: uncontended write");
                    appointment.order_id = Some(order_id);
                }
            }
        }
    }

    // ── Arena + index plumbing ───────────────────────────────────

    pub(super) fn insert_slot(&self, slot: SlotState) {
        self.slot_index.insert(slot.key(), slot.id);
        self.provider_slots
            .entry(slot.provider_id)
            .or_default()
            .push(slot.id);
        self.slots.insert(slot.id, Arc::new(RwLock::new(slot)));
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
    }

    pub(super) fn remove_slot(&self, id: &Ulid) {
        if let Some((_, arc)) = self.slots.remove(id) {
            let slot = arc.try_read().expect("remove: uncontended read");
            self.slot_index.remove(&slot.key());
            if let Some(mut ids) = self.provider_slots.get_mut(&slot.provider_id) {
                ids.retain(|s| s != id);
            }
        }
        metrics::gauge!(crate::observability::SLOTS_ACTIVE).set(self.slots.len() as f64);
    }

    pub(super) fn insert_appointment(&self, appointment: AppointmentState) {
        self.appointment_numbers
            .insert(appointment.number.clone(), appointment.id);
        self.customer_appointments
            .entry(appointment.customer_id)
            .or_default()
            .push(appointment.id);
        self.appointments
            .insert(appointment.id, Arc::new(RwLock::new(appointment)));
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn get_appointment(&self, id: &Ulid) -> Option<SharedAppointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<ProviderProfile> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn slot_id_for(&self, key: &SlotKey) -> Option<Ulid> {
        self.slot_index.get(key).map(|e| *e.value())
    }

    pub fn appointment_id_for_number(&self, number: &str) -> Option<Ulid> {
        self.appointment_numbers.get(number).map(|e| *e.value())
    }

    pub(super) fn slot_ids_for_provider(&self, provider_id: &Ulid) -> Vec<Ulid> {
        self.provider_slots
            .get(provider_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub(super) fn appointment_ids_for_customer(&self, customer_id: &Ulid) -> Vec<Ulid> {
        self.customer_appointments
            .get(customer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub(super) fn appointment_ids(&self) -> Vec<Ulid> {
        self.appointments.iter().map(|e| *e.key()).collect()
    }

    pub(super) fn provider_slot_count(&self, provider_id: &Ulid) -> usize {
        self.provider_slots
            .get(provider_id)
            .map(|e| e.value().len())
            .unwrap_or(0)
    }

    // ── Journal access ───────────────────────────────────────────

    /// Append one event via the group-commit writer, bounded by the
    /// configured timeout. Nothing is applied to in-memory state unless
    /// this returns Ok.
    pub(super) async fn journal_append(&self, event: &Event) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| SchedulerError::Journal("journal writer shut down".into()))?;
        let response = tokio::time::timeout(self.config.journal_timeout, rx)
            .await
            .map_err(|_| SchedulerError::Timeout("journal append"))?;
        response
            .map_err(|_| SchedulerError::Journal("journal writer dropped response".into()))?
            .map_err(|e| SchedulerError::Journal(e.to_string()))
    }

    /// Rewrite the journal as one snapshot per live record. Histories ride
    /// inside the snapshots, so nothing observable is lost.
    pub async fn rewrite_journal(&self) -> Result<(), SchedulerError> {
        let mut events: Vec<Event> = Vec::new();
        for entry in self.providers.iter() {
            events.push(Event::ProviderRegistered {
                profile: entry.value().clone(),
            });
        }
        // Clone the arcs out of the maps first; awaiting a record lock
        // while iterating a shard would hold the shard against writers.
        let slot_arcs: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for arc in slot_arcs {
            let slot = arc.read().await.clone();
            events.push(Event::SlotSnapshot { slot });
        }
        let appointment_arcs: Vec<SharedAppointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        for arc in appointment_arcs {
            let appointment = arc.read().await.clone();
            events.push(Event::AppointmentSnapshot { appointment });
        }

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Rewrite {
                events,
                response: tx,
            })
            .await
            .map_err(|_| SchedulerError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Journal("journal writer dropped response".into()))?
            .map_err(|e| SchedulerError::Journal(e.to_string()))
    }

    pub async fn journal_appends_since_rewrite(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceRewrite { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ── Providers ────────────────────────────────────────────────

    /// Make a provider known to the scheduler. Journaled so the delivery
    /// fee rule survives restarts.
    pub async fn register_provider(&self, profile: ProviderProfile) -> Result<(), SchedulerError> {
        if profile.name.is_empty() || profile.name.len() > crate::limits::MAX_NAME_LEN {
            return Err(SchedulerError::Validation("provider name length"));
        }
        if profile.delivery_fee_cents < 0 {
            return Err(SchedulerError::Validation("negative delivery fee"));
        }
        if self.providers.contains_key(&profile.id) {
            return Err(SchedulerError::AlreadyExists(profile.id));
        }
        let event = Event::ProviderRegistered {
            profile: profile.clone(),
        };
        self.journal_append(&event).await?;
        self.providers.insert(profile.id, profile);
        Ok(())
    }

    // ── Notification plumbing ────────────────────────────────────

    pub(super) fn notify_appointment(
        &self,
        kind: NotificationKind,
        appointment: &AppointmentState,
        message: &str,
    ) {
        self.notify.send(Notification {
            kind,
            provider_id: appointment.provider_id,
            customer_id: Some(appointment.customer_id),
            appointment_id: Some(appointment.id),
            slot_id: Some(appointment.slot_id),
            message: message.to_string(),
        });
    }

    pub(super) fn notify_slot(&self, kind: NotificationKind, slot: &SlotState, message: &str) {
        self.notify.send(Notification {
            kind,
            provider_id: slot.provider_id,
            customer_id: None,
            appointment_id: None,
            slot_id: Some(slot.id),
            message: message.to_string(),
        });
    }
}

/// Count one scheduling operation, labelled by name and outcome.
pub(super) fn record_op<T>(op: &'static str, result: &Result<T, SchedulerError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => match e.kind() {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Storage => "storage",
        },
    };
    metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => op, "status" => status)
        .increment(1);
}

// ── Shared apply helpers ─────────────────────────────────────────
// The live mutation paths and journal replay both go through these, so a
// replayed store is bit-for-bit the store that produced the journal.

#[allow(clippy::too_many_arguments)]
pub(super) fn new_slot(
    id: Ulid,
    provider_id: Ulid,
    date: chrono::NaiveDate,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    slot_type: SlotType,
    capacity: u32,
    recurrence: Option<RecurrenceMeta>,
    actor: Actor,
    at: NaiveDateTime,
) -> SlotState {
    let mut slot = SlotState::new(
        id, provider_id, date, start_time, end_time, slot_type, capacity, recurrence,
    );
    slot.record(at, actor, SlotChange::Created);
    slot
}

#[allow(clippy::too_many_arguments)]
pub(super) fn new_appointment(
    id: Ulid,
    number: String,
    customer_id: Ulid,
    provider_id: Ulid,
    slot_id: Ulid,
    date: chrono::NaiveDate,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    services: Vec<ServiceItem>,
    estimate: CostEstimate,
    at: NaiveDateTime,
) -> AppointmentState {
    AppointmentState {
        id,
        number,
        customer_id,
        provider_id,
        slot_id,
        order_id: None,
        date,
        start_time,
        end_time,
        status: AppointmentStatus::Pending,
        services,
        estimate,
        confirmation: None,
        refund_requested: false,
        completion_notes: None,
        status_history: vec![StatusChange {
            from: None,
            to: AppointmentStatus::Pending,
            at,
            actor: Actor::Customer(customer_id),
            note: None,
        }],
    }
}

pub(super) fn apply_reserve(slot: &mut SlotState, appointment: &AppointmentState, at: NaiveDateTime) {
    slot.add_booking(appointment.id, appointment.customer_id, at);
    slot.record(
        at,
        Actor::Customer(appointment.customer_id),
        SlotChange::BookingAdded {
            appointment_id: appointment.id,
        },
    );
}

pub(super) fn apply_capacity_change(
    slot: &mut SlotState,
    capacity: u32,
    actor: Actor,
    at: NaiveDateTime,
) {
    let from = slot.max_capacity;
    slot.max_capacity = capacity;
    slot.derive_status();
    slot.record(at, actor, SlotChange::CapacityChanged { from, to: capacity });
}

pub(super) fn apply_block_toggle(
    slot: &mut SlotState,
    blocked: bool,
    reason: Option<String>,
    actor: Actor,
    at: NaiveDateTime,
) {
    if blocked {
        slot.status = SlotStatus::Blocked;
        slot.record(at, actor, SlotChange::Blocked { reason });
    } else {
        slot.status = SlotStatus::Available;
        slot.derive_status();
        slot.record(at, actor, SlotChange::Unblocked);
    }
}

pub(super) fn apply_confirm(
    appointment: &mut AppointmentState,
    actor: Actor,
    method: ConfirmationMethod,
    code: String,
    at: NaiveDateTime,
) {
    appointment.confirmation = Some(Confirmation {
        at,
        by: actor,
        method,
        code,
    });
    appointment.transition(AppointmentStatus::Confirmed, at, actor, None);
}

pub(super) fn apply_complete(
    appointment: &mut AppointmentState,
    actor: Actor,
    notes: Option<String>,
    at: NaiveDateTime,
) {
    appointment.completion_notes = notes.clone();
    appointment.transition(AppointmentStatus::Completed, at, actor, notes);
}

pub(super) fn apply_cancel(
    appointment: &mut AppointmentState,
    slot: Option<&mut SlotState>,
    actor: Actor,
    reason: Option<String>,
    refund_requested: bool,
    at: NaiveDateTime,
) {
    if let Some(slot) = slot
        && slot.release_booking(appointment.id)
    {
        slot.record(
            at,
            actor,
            SlotChange::BookingReleased {
                appointment_id: appointment.id,
            },
        );
    }
    appointment.refund_requested = refund_requested;
    appointment.transition(AppointmentStatus::Cancelled, at, actor, reason);
}

#[allow(clippy::too_many_arguments)]
pub(super) fn apply_reschedule(
    appointment: &mut AppointmentState,
    old_slot: &mut SlotState,
    new_slot: &mut SlotState,
    date: chrono::NaiveDate,
    start_time: chrono::NaiveTime,
    end_time: chrono::NaiveTime,
    actor: Actor,
    reason: Option<String>,
    at: NaiveDateTime,
) {
    if old_slot.release_booking(appointment.id) {
        old_slot.record(
            at,
            actor,
            SlotChange::BookingReleased {
                appointment_id: appointment.id,
            },
        );
    }
    new_slot.add_booking(appointment.id, appointment.customer_id, at);
    new_slot.record(
        at,
        actor,
        SlotChange::BookingAdded {
            appointment_id: appointment.id,
        },
    );
    appointment.slot_id = new_slot.id;
    appointment.date = date;
    appointment.start_time = start_time;
    appointment.end_time = end_time;
    appointment.transition(AppointmentStatus::Rescheduled, at, actor, reason);
}
