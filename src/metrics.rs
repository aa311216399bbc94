// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the failover layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `failover_mirror_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: primary, mirror
//! - `kind`: failover, failback, manual_switch, failover_failed
//! - `status`: success, error, timeout, rejected, skipped

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::supervisor::StoreRole;

/// Record an active-designation transition (or a refused one)
pub fn record_transition(kind: &str) {
    counter!(
        "failover_mirror_transitions_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Set which store is active (0 = primary, 1 = mirror)
pub fn set_active_store(role: StoreRole) {
    let value = match role {
        StoreRole::Primary => 0.0,
        StoreRole::Mirror => 1.0,
    };
    gauge!("failover_mirror_active_store").set(value);
}

/// Record the outcome of one liveness probe
pub fn record_health_probe(store: &str, status: &str) {
    counter!(
        "failover_mirror_health_probes_total",
        "store" => store.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record liveness probe latency
pub fn record_probe_latency(store: &str, duration: Duration) {
    histogram!(
        "failover_mirror_probe_seconds",
        "store" => store.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one mirror write attempt
pub fn record_mirror_write(op: &str, status: &str) {
    counter!(
        "failover_mirror_writes_total",
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a change-feed event consumed by the streaming propagator
pub fn record_feed_event(collection: &str) {
    counter!(
        "failover_mirror_feed_events_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, status: &str) {
    counter!(
        "failover_mirror_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; they must not panic.
    #[test]
    fn test_recorders_without_exporter() {
        record_transition("failover");
        set_active_store(StoreRole::Mirror);
        record_health_probe("primary", "success");
        record_probe_latency("primary", Duration::from_millis(3));
        record_mirror_write("insert", "success");
        record_feed_event("orders");
        record_circuit_call("mirror_writes", "rejected");
    }
}
