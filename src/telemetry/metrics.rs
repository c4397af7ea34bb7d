//! Metric instrument factories for reconq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter configured the global provider is a no-op, so these
//! are safe to call from tests.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("reconq")
}

/// Counter: watch events received.
/// Labels: `controller`, `stream` ("parent" | "dependent"), `event`.
pub fn events_received() -> Counter<u64> {
    meter()
        .u64_counter("reconq.events.received")
        .with_description("Number of watch events received")
        .build()
}

/// Counter: watch events that produced no work.
/// Labels: `controller`, `stream`, `reason` ("malformed" | "unowned").
pub fn events_dropped() -> Counter<u64> {
    meter()
        .u64_counter("reconq.events.dropped")
        .with_description("Number of watch events dropped without enqueueing")
        .build()
}

/// Counter: queue operations.
/// Labels: `queue`, `operation` ("queued" | "merged" | "deferred" | "delayed" | "rejected").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("reconq.queue.operations")
        .with_description("Number of work queue operations")
        .build()
}

/// Counter: reconcile outcomes.
/// Labels: `controller`, `result` ("synced" | "not_found" | "terminating" | "error").
pub fn reconcile_results() -> Counter<u64> {
    meter()
        .u64_counter("reconq.reconcile.results")
        .with_description("Number of processed work items by outcome")
        .build()
}

/// Histogram: time spent processing one work item.
/// Labels: `controller`.
pub fn reconcile_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("reconq.reconcile.duration_ms")
        .with_description("Work item processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
