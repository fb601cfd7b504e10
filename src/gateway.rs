//! Seams to the external collaborators: message delivery and billing.
//! Both are invoked strictly after the core transition is committed, and
//! neither can unwind it; failures are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::notify::Notification;
use crate::scheduler::Scheduler;

#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound push/email/SMS delivery. The mechanics live outside this crate.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Billing-side order creation for a completed appointment.
#[async_trait]
pub trait OrderBridge: Send + Sync {
    async fn create_order(&self, appointment_id: Ulid, total_cents: i64)
        -> Result<Ulid, DeliveryError>;
}

/// Forward one provider's notification stream to a gateway until the hub
/// channel closes. Log-and-continue on every failure.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<Notification>,
    gateway: Arc<dyn NotificationGateway>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = gateway.deliver(&notification).await {
                    metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL).increment(1);
                    warn!("notification delivery failed: {e}");
                } else {
                    debug!("delivered {:?}", notification.kind);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("notification dispatcher lagged, skipped {skipped}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Create a billing order for a completed appointment and attach the
/// resulting order id. Bridge failure leaves the appointment completed and
/// unlinked; the linkage can be retried later.
pub async fn bridge_completed_order(
    scheduler: &Scheduler,
    bridge: &dyn OrderBridge,
    appointment_id: Ulid,
) {
    let Some(appointment) = scheduler.get_appointment(&appointment_id) else {
        return;
    };
    let total = {
        let guard = appointment.read().await;
        guard.estimate.total_cents
    };
    match bridge.create_order(appointment_id, total).await {
        Ok(order_id) => {
            if let Err(e) = scheduler.link_order(appointment_id, order_id).await {
                warn!("order {order_id} created but not linked: {e}");
            }
        }
        Err(e) => warn!("order bridge failed for {appointment_id}: {e}"),
    }
}
