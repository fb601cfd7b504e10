use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Who performed a change. Booking and history entries never point at a raw
/// id without saying what kind of actor it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Customer(Ulid),
    Provider(Ulid),
    Admin(Ulid),
    System,
}

/// Uniqueness key for a slot: a provider offers at most one slot per
/// (date, start time).
pub type SlotKey = (Ulid, NaiveDate, NaiveTime);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Full,
    Blocked,
    Closed,
}

/// Orthogonal classification: affects pricing defaults, never capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotType {
    Regular,
    Express,
    Premium,
    Bulk,
}

impl SlotType {
    /// Price multiplier in basis points (10_000 = 1.0x).
    pub fn price_multiplier_bps(&self) -> i64 {
        match self {
            SlotType::Regular => 10_000,
            SlotType::Express => 15_000,
            SlotType::Premium => 20_000,
            SlotType::Bulk => 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
}

/// One seat taken on a slot. Stays in the list forever; release flips the
/// status instead of removing the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEntry {
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub status: BookingStatus,
    pub booked_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotChange {
    Created,
    CapacityChanged { from: u32, to: u32 },
    BookingAdded { appointment_id: Ulid },
    BookingReleased { appointment_id: Ulid },
    Blocked { reason: Option<String> },
    Unblocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHistoryEntry {
    pub at: NaiveDateTime,
    pub actor: Actor,
    pub change: SlotChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
}

/// Present on slots stamped out by the recurrence generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceMeta {
    pub frequency: RecurrenceFrequency,
    pub until: NaiveDate,
    pub parent_slot_id: Option<Ulid>,
}

/// A provider's bookable window on one calendar day.
///
/// Invariant: `current_bookings <= max_capacity`, and `current_bookings`
/// equals the number of `Active` entries in `bookings`. Both are only ever
/// mutated under the slot's write lock, together, with `status` re-derived
/// in the same critical section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub slot_type: SlotType,
    pub max_capacity: u32,
    pub current_bookings: u32,
    pub status: SlotStatus,
    pub bookings: Vec<BookingEntry>,
    pub recurrence: Option<RecurrenceMeta>,
    /// Append-only log of structural changes.
    pub history: Vec<SlotHistoryEntry>,
}

impl SlotState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        slot_type: SlotType,
        max_capacity: u32,
        recurrence: Option<RecurrenceMeta>,
    ) -> Self {
        Self {
            id,
            provider_id,
            date,
            start_time,
            end_time,
            slot_type,
            max_capacity,
            current_bookings: 0,
            status: SlotStatus::Available,
            bookings: Vec::new(),
            recurrence,
            history: Vec::new(),
        }
    }

    pub fn key(&self) -> SlotKey {
        (self.provider_id, self.date, self.start_time)
    }

    pub fn start_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_bookings)
    }

    /// The capacity predicate. Only meaningful as a reservation gate when
    /// evaluated under the slot's write lock.
    pub fn can_accept(&self, requested: u32) -> bool {
        self.status == SlotStatus::Available
            && self.current_bookings + requested <= self.max_capacity
    }

    pub fn has_active_booking_for(&self, customer_id: Ulid) -> bool {
        self.bookings
            .iter()
            .any(|b| b.customer_id == customer_id && b.status == BookingStatus::Active)
    }

    pub fn active_booking(&self, appointment_id: Ulid) -> Option<&BookingEntry> {
        self.bookings
            .iter()
            .find(|b| b.appointment_id == appointment_id && b.status == BookingStatus::Active)
    }

    /// Take one seat. Caller has already checked `can_accept` under the
    /// same write guard; this still saturates rather than overshoot.
    pub(crate) fn add_booking(
        &mut self,
        appointment_id: Ulid,
        customer_id: Ulid,
        at: NaiveDateTime,
    ) {
        self.bookings.push(BookingEntry {
            appointment_id,
            customer_id,
            status: BookingStatus::Active,
            booked_at: at,
        });
        self.current_bookings = (self.current_bookings + 1).min(self.max_capacity);
        self.derive_status();
    }

    /// Give one seat back. Idempotent: a second release of the same
    /// appointment finds no active entry and decrements nothing.
    pub(crate) fn release_booking(&mut self, appointment_id: Ulid) -> bool {
        let Some(entry) = self
            .bookings
            .iter_mut()
            .find(|b| b.appointment_id == appointment_id && b.status == BookingStatus::Active)
        else {
            return false;
        };
        entry.status = BookingStatus::Cancelled;
        self.current_bookings = self.current_bookings.saturating_sub(1);
        self.derive_status();
        true
    }

    /// Re-derive Available/Full from the counter. Blocked and Closed are
    /// explicit states and never overwritten here.
    pub(crate) fn derive_status(&mut self) {
        match self.status {
            SlotStatus::Blocked | SlotStatus::Closed => {}
            SlotStatus::Available | SlotStatus::Full => {
                self.status = if self.current_bookings >= self.max_capacity {
                    SlotStatus::Full
                } else {
                    SlotStatus::Available
                };
            }
        }
    }

    pub(crate) fn record(&mut self, at: NaiveDateTime, actor: Actor, change: SlotChange) {
        self.history.push(SlotHistoryEntry { at, actor, change });
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Rescheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// The full transition table. Everything not listed is rejected.
    pub fn can_transition_to(self, to: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match self {
            Pending => matches!(to, Confirmed | Cancelled | Rescheduled),
            Confirmed => matches!(to, InProgress | Completed | Cancelled | Rescheduled | NoShow),
            InProgress => matches!(to, Completed),
            Rescheduled => matches!(to, Confirmed | Cancelled),
            Completed | Cancelled | NoShow => false,
        }
    }

    /// States from which a customer may still cancel (cutoff permitting).
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Rescheduled)
    }

    /// States from which a booking may be moved to another slot.
    pub fn is_reschedulable(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Rescheduled => "rescheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationMethod {
    App,
    Phone,
    Sms,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub at: NaiveDateTime,
    pub by: Actor,
    pub method: ConfirmationMethod,
    pub code: String,
}

/// A planned service line item (e.g. "shirt pressing" x 4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub service_id: Ulid,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// All money as integer cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub subtotal_cents: i64,
    pub delivery_fee_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: Option<AppointmentStatus>,
    pub to: AppointmentStatus,
    pub at: NaiveDateTime,
    pub actor: Actor,
    pub note: Option<String>,
}

/// A customer's reservation against one slot.
///
/// Date and times are a denormalized copy of the slot's schedule so the
/// record survives slot edits; only a reschedule rewrites them. Status is
/// only ever changed through `transition`, which appends to the
/// append-only `status_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentState {
    pub id: Ulid,
    /// Human-readable number, e.g. `APT-20260823-4821`.
    pub number: String,
    pub customer_id: Ulid,
    pub provider_id: Ulid,
    pub slot_id: Ulid,
    pub order_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: AppointmentStatus,
    pub services: Vec<ServiceItem>,
    pub estimate: CostEstimate,
    pub confirmation: Option<Confirmation>,
    pub refund_requested: bool,
    pub completion_notes: Option<String>,
    pub status_history: Vec<StatusChange>,
}

impl AppointmentState {
    pub fn start_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn minutes_until_start(&self, now: NaiveDateTime) -> i64 {
        (self.start_at() - now).num_minutes()
    }

    /// Apply a transition and append exactly one history entry. Guards
    /// (transition table, cutoffs) are the caller's job; replay trusts the
    /// journal.
    pub(crate) fn transition(
        &mut self,
        to: AppointmentStatus,
        at: NaiveDateTime,
        actor: Actor,
        note: Option<String>,
    ) {
        let from = self.status;
        self.status = to;
        self.status_history.push(StatusChange {
            from: Some(from),
            to,
            at,
            actor,
            note,
        });
    }
}

/// The slice of a provider profile the scheduler needs: existence and the
/// delivery-fee rule. Full profile CRUD lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: Ulid,
    pub name: String,
    pub delivery_fee_cents: i64,
    /// Delivery fee waived when the subtotal reaches this amount.
    pub free_delivery_over_cents: Option<i64>,
}

// ── Journal events ───────────────────────────────────────────────

/// The journal record format. One event per logical operation: a
/// reschedule is a single record even though it touches two slots and an
/// appointment, so replay can never observe a half-applied move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered {
        profile: ProviderProfile,
    },
    SlotCreated {
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        slot_type: SlotType,
        capacity: u32,
        recurrence: Option<RecurrenceMeta>,
        actor: Actor,
        at: NaiveDateTime,
    },
    SlotCapacityChanged {
        id: Ulid,
        capacity: u32,
        actor: Actor,
        at: NaiveDateTime,
    },
    SlotBlockToggled {
        id: Ulid,
        blocked: bool,
        reason: Option<String>,
        actor: Actor,
        at: NaiveDateTime,
    },
    SlotDeleted {
        id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        number: String,
        customer_id: Ulid,
        provider_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        services: Vec<ServiceItem>,
        estimate: CostEstimate,
        at: NaiveDateTime,
    },
    AppointmentConfirmed {
        id: Ulid,
        actor: Actor,
        method: ConfirmationMethod,
        code: String,
        at: NaiveDateTime,
    },
    AppointmentStarted {
        id: Ulid,
        actor: Actor,
        at: NaiveDateTime,
    },
    AppointmentCompleted {
        id: Ulid,
        actor: Actor,
        notes: Option<String>,
        at: NaiveDateTime,
    },
    AppointmentCancelled {
        id: Ulid,
        actor: Actor,
        reason: Option<String>,
        refund_requested: bool,
        at: NaiveDateTime,
    },
    AppointmentRescheduled {
        id: Ulid,
        old_slot_id: Ulid,
        new_slot_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        actor: Actor,
        reason: Option<String>,
        at: NaiveDateTime,
    },
    AppointmentNoShow {
        id: Ulid,
        actor: Actor,
        at: NaiveDateTime,
    },
    OrderLinked {
        id: Ulid,
        order_id: Ulid,
    },
    /// Compaction-only: full current state of a slot, history included.
    SlotSnapshot {
        slot: SlotState,
    },
    /// Compaction-only: full current state of an appointment.
    AppointmentSnapshot {
        appointment: AppointmentState,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SlotFilters {
    pub slot_type: Option<SlotType>,
    /// Only return slots with at least this many free seats.
    pub min_remaining: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub total: u32,
    pub available: u32,
    pub full: u32,
    pub blocked: u32,
    pub total_capacity: u32,
    pub total_booked: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppointmentStats {
    pub total: u32,
    pub pending: u32,
    pub confirmed: u32,
    pub in_progress: u32,
    pub rescheduled: u32,
    pub completed: u32,
    pub cancelled: u32,
    pub no_show: u32,
}

/// Result of a bulk slot generation run. Best-effort: one day's failure
/// never aborts the rest.
#[derive(Debug, Clone, Default)]
pub struct BulkCreateOutcome {
    pub created: Vec<Ulid>,
    pub skipped_existing: u32,
    pub failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn slot(capacity: u32) -> SlotState {
        SlotState::new(
            Ulid::new(),
            Ulid::new(),
            d(2),
            t(9, 0),
            t(11, 0),
            SlotType::Regular,
            capacity,
            None,
        )
    }

    fn appointment() -> AppointmentState {
        AppointmentState {
            id: Ulid::new(),
            number: "APT-20260302-0001".into(),
            customer_id: Ulid::new(),
            provider_id: Ulid::new(),
            slot_id: Ulid::new(),
            order_id: None,
            date: d(2),
            start_time: t(9, 0),
            end_time: t(11, 0),
            status: AppointmentStatus::Pending,
            services: vec![],
            estimate: CostEstimate::default(),
            confirmation: None,
            refund_requested: false,
            completion_notes: None,
            status_history: Vec::new(),
        }
    }

    #[test]
    fn capacity_predicate() {
        let mut s = slot(2);
        assert!(s.can_accept(1));
        assert!(s.can_accept(2));
        assert!(!s.can_accept(3));

        s.add_booking(Ulid::new(), Ulid::new(), d(1).and_time(t(8, 0)));
        assert!(s.can_accept(1));
        assert!(!s.can_accept(2));
        assert_eq!(s.status, SlotStatus::Available);

        s.add_booking(Ulid::new(), Ulid::new(), d(1).and_time(t(8, 5)));
        assert!(!s.can_accept(1));
        assert_eq!(s.status, SlotStatus::Full);
        assert_eq!(s.remaining(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let mut s = slot(1);
        let appt = Ulid::new();
        s.add_booking(appt, Ulid::new(), d(1).and_time(t(8, 0)));
        assert_eq!(s.current_bookings, 1);
        assert_eq!(s.status, SlotStatus::Full);

        assert!(s.release_booking(appt));
        assert_eq!(s.current_bookings, 0);
        assert_eq!(s.status, SlotStatus::Available);

        // Second release finds no active entry, so no double decrement.
        assert!(!s.release_booking(appt));
        assert_eq!(s.current_bookings, 0);
        assert_eq!(s.bookings.len(), 1);
        assert_eq!(s.bookings[0].status, BookingStatus::Cancelled);
    }

    #[test]
    fn blocked_status_survives_derivation() {
        let mut s = slot(2);
        s.status = SlotStatus::Blocked;
        let appt = Ulid::new();
        s.add_booking(appt, Ulid::new(), d(1).and_time(t(8, 0)));
        assert_eq!(s.status, SlotStatus::Blocked);
        s.release_booking(appt);
        assert_eq!(s.status, SlotStatus::Blocked);
        // Blocked slots never accept, whatever the counter says.
        assert!(!s.can_accept(1));
    }

    #[test]
    fn duplicate_customer_detection() {
        let mut s = slot(3);
        let customer = Ulid::new();
        let appt = Ulid::new();
        s.add_booking(appt, customer, d(1).and_time(t(8, 0)));
        assert!(s.has_active_booking_for(customer));

        s.release_booking(appt);
        assert!(!s.has_active_booking_for(customer));
    }

    #[test]
    fn transition_table_closure() {
        use AppointmentStatus::*;
        let all = [
            Pending, Confirmed, InProgress, Rescheduled, Completed, Cancelled, NoShow,
        ];
        // Terminal states go nowhere.
        for from in [Completed, Cancelled, NoShow] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        // Nothing re-enters Pending.
        for from in all {
            assert!(!from.can_transition_to(Pending));
        }
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(!Pending.can_transition_to(NoShow));
        assert!(!Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Rescheduled));
        assert!(Rescheduled.can_transition_to(Confirmed));
    }

    #[test]
    fn transition_appends_exactly_one_entry() {
        let mut a = appointment();
        a.transition(
            AppointmentStatus::Confirmed,
            d(1).and_time(t(12, 0)),
            Actor::System,
            None,
        );
        assert_eq!(a.status_history.len(), 1);
        assert_eq!(a.status_history[0].from, Some(AppointmentStatus::Pending));
        assert_eq!(a.status_history[0].to, AppointmentStatus::Confirmed);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentCancelled {
            id: Ulid::new(),
            actor: Actor::Customer(Ulid::new()),
            reason: Some("moved house".into()),
            refund_requested: true,
            at: d(2).and_time(t(10, 30)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn minutes_until_start() {
        let a = appointment();
        assert_eq!(a.minutes_until_start(d(2).and_time(t(7, 0))), 120);
        assert_eq!(a.minutes_until_start(d(2).and_time(t(9, 30))), -30);
    }
}
