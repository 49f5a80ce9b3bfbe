//! Event bus metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder every
//! call is a no-op. Services that want Prometheus scraping install
//! `metrics-exporter-prometheus` in their composition root and call
//! [`register_metrics`] once.

use metrics::{describe_counter, describe_gauge};

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge};

/// Messages accepted by the broker.
pub const PUBLISHED_TOTAL: &str = "event_bus_messages_published_total";
/// Publishes that failed or were skipped while disconnected.
pub const PUBLISH_FAILURES_TOTAL: &str = "event_bus_publish_failures_total";
/// Deliveries acknowledged after a successful handler run.
pub const ACKED_TOTAL: &str = "event_bus_messages_acked_total";
/// Deliveries returned to their queue for another attempt.
pub const REQUEUED_TOTAL: &str = "event_bus_messages_requeued_total";
/// Deliveries dropped as unprocessable.
pub const DISCARDED_TOTAL: &str = "event_bus_messages_discarded_total";
/// Reconnect attempts made.
pub const RECONNECT_ATTEMPTS_TOTAL: &str = "event_bus_reconnect_attempts_total";
/// 1 while connected, 0 otherwise.
pub const CONNECTED: &str = "event_bus_connected";

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(PUBLISHED_TOTAL, "Total number of messages accepted by the broker");
    describe_counter!(
        PUBLISH_FAILURES_TOTAL,
        "Total number of publishes that failed or were skipped while disconnected"
    );
    describe_counter!(ACKED_TOTAL, "Total number of deliveries acknowledged");
    describe_counter!(REQUEUED_TOTAL, "Total number of deliveries requeued for redelivery");
    describe_counter!(DISCARDED_TOTAL, "Total number of deliveries discarded without requeue");
    describe_counter!(RECONNECT_ATTEMPTS_TOTAL, "Total number of broker reconnect attempts");
    describe_gauge!(CONNECTED, "Whether the event bus currently holds a broker connection");
}
