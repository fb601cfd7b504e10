use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    SlotCreated,
    SlotBlocked,
    SlotUnblocked,
    AppointmentBooked,
    AppointmentConfirmed,
    AppointmentStarted,
    AppointmentCompleted,
    AppointmentCancelled,
    AppointmentRescheduled,
    AppointmentNoShow,
}

/// A status-change message for delivery to customers/providers. Purely
/// informational: emitted only after the underlying operation is durably
/// committed, and dropped (never rolled back into the operation) when no
/// one is listening or delivery fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub provider_id: Ulid,
    pub customer_id: Option<Ulid>,
    pub appointment_id: Option<Ulid>,
    pub slot_id: Option<Ulid>,
    pub message: String,
}

impl Notification {
    /// JSON body handed to external gateways.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

/// Broadcast hub, one channel per provider.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a provider's notifications. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget send. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.provider_id) {
            let _ = sender.send(notification);
        }
    }

    pub fn remove(&self, provider_id: &Ulid) {
        self.channels.remove(provider_id);
    }
}
