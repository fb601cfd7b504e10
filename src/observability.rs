use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: scheduling operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "slotwise_operations_total";

/// Counter: successful slot reservations.
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: reservations rejected on the capacity predicate.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotwise_booking_conflicts_total";

/// Counter: cancellations committed.
pub const CANCELLATIONS_TOTAL: &str = "slotwise_cancellations_total";

/// Counter: reschedules committed.
pub const RESCHEDULES_TOTAL: &str = "slotwise_reschedules_total";

/// Counter: notification deliveries that failed (log-and-continue).
pub const NOTIFY_FAILURES_TOTAL: &str = "slotwise_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently held in the store.
pub const SLOTS_ACTIVE: &str = "slotwise_slots_active";

/// Gauge: appointments in non-terminal states.
pub const APPOINTMENTS_OPEN: &str = "slotwise_appointments_open";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "slotwise_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "slotwise_journal_flush_batch_size";

/// Install the tracing subscriber and, when a port is given, the
/// Prometheus metrics exporter. Call once from the embedding process.
pub fn init(metrics_port: Option<u16>) {
    tracing_subscriber::fmt::init();
    let Some(port) = metrics_port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
