//! Metrics infrastructure for the webhook router
//!
//! Provides Prometheus-compatible metrics for:
//! - Inbound events and event log appends
//! - Delivery attempts, outcomes and latency
//! - Live fan-out broadcasts and subscribers

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an inbound request matched to a route
pub fn record_event_received(route: &str) {
    counter!(
        "envoi_events_received_total",
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record an event log append
pub fn record_append(route: &str, success: bool) {
    if success {
        counter!(
            "envoi_events_appended_total",
            "route" => route.to_string()
        )
        .increment(1);
    } else {
        counter!(
            "envoi_append_failures_total",
            "route" => route.to_string()
        )
        .increment(1);
    }
}

/// Record a single delivery attempt
pub fn record_delivery_attempt() {
    counter!("envoi_delivery_attempts_total").increment(1);
}

/// Record a terminal delivery outcome (`delivered` or `exhausted`)
pub fn record_delivery_outcome(outcome: &str, duration: Duration) {
    counter!(
        "envoi_deliveries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "envoi_delivery_duration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a task the scheduler refused
pub fn record_delivery_rejected(reason: &str) {
    counter!(
        "envoi_deliveries_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a broadcast and how many subscribers it reached
pub fn record_broadcast(reached: usize) {
    counter!("envoi_broadcasts_total").increment(1);
    histogram!("envoi_broadcast_recipients").record(reached as f64);
}

/// Update the connected subscribers gauge
pub fn set_subscribers(count: usize) {
    gauge!("envoi_subscribers").set(count as f64);
}
