use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::AppointmentStatus;

/// Coarse classification a caller can base its retry decision on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request; retrying the same call can never succeed.
    Validation,
    NotFound,
    /// Lost a race or hit a state guard; safe to retry against a
    /// different slot, never blindly against the same one.
    Conflict,
    Forbidden,
    /// Bounded wait expired; the same operation is safe to retry.
    Timeout,
    Storage,
}

#[derive(Debug)]
pub enum SchedulerError {
    Validation(&'static str),
    LimitExceeded(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateSlot {
        provider_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
    },
    SlotFull(Ulid),
    DuplicateBooking {
        customer_id: Ulid,
        slot_id: Ulid,
    },
    HasBookings(Ulid),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    NotCancellable(&'static str),
    NotReschedulable(&'static str),
    Forbidden(&'static str),
    Timeout(&'static str),
    Journal(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        use SchedulerError::*;
        match self {
            Validation(_) | LimitExceeded(_) => ErrorKind::Validation,
            NotFound(_) => ErrorKind::NotFound,
            AlreadyExists(_)
            | DuplicateSlot { .. }
            | SlotFull(_)
            | DuplicateBooking { .. }
            | HasBookings(_)
            | InvalidTransition { .. }
            | NotCancellable(_)
            | NotReschedulable(_) => ErrorKind::Conflict,
            Forbidden(_) => ErrorKind::Forbidden,
            Timeout(_) => ErrorKind::Timeout,
            Journal(_) => ErrorKind::Storage,
        }
    }

    /// Whether repeating the exact same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SchedulerError::*;
        match self {
            Validation(msg) => write!(f, "validation failed: {msg}"),
            LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            NotFound(id) => write!(f, "not found: {id}"),
            AlreadyExists(id) => write!(f, "already exists: {id}"),
            DuplicateSlot {
                provider_id,
                date,
                start_time,
            } => write!(
                f,
                "provider {provider_id} already has a slot on {date} at {start_time}"
            ),
            SlotFull(id) => write!(f, "slot {id} is full"),
            DuplicateBooking {
                customer_id,
                slot_id,
            } => write!(
                f,
                "customer {customer_id} already holds a booking on slot {slot_id}"
            ),
            HasBookings(id) => write!(f, "slot {id} has active bookings"),
            InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            NotCancellable(msg) => write!(f, "not cancellable: {msg}"),
            NotReschedulable(msg) => write!(f, "not reschedulable: {msg}"),
            Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Timeout(what) => write!(f, "timed out: {what}"),
            Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}
