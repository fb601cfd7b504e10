//! slotwise: an in-memory, journal-backed reservation core for pickup
//! and delivery time slots.
//!
//! Providers publish capacity-limited slots, customers book appointments
//! against them, and every mutation is journaled before it is applied so
//! a restart replays back to the exact same state. Collaborators plug in
//! at two seams: a [`gateway::NotificationGateway`] drains the broadcast
//! feed, and a [`gateway::OrderBridge`] turns completed appointments
//! into orders.

pub mod config;
pub mod gateway;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod reaper;
pub mod recurrence;
pub mod scheduler;
