//! Metric instrument factories for auditq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"auditq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("auditq")
}

/// Counter: items handed to the analyzer.
/// Labels: `slot`.
pub fn items_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("auditq.items.dispatched")
        .with_description("Number of items dispatched to the analyzer")
        .build()
}

/// Counter: outcome records written.
/// Labels: `status`, `error_class` (failures only).
pub fn outcomes() -> Counter<u64> {
    meter()
        .u64_counter("auditq.items.outcomes")
        .with_description("Number of outcome records persisted")
        .build()
}

/// Counter: analyses that reported a rate limit.
/// Labels: `slot`.
pub fn rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("auditq.slots.rate_limited")
        .with_description("Rate-limit responses per worker slot")
        .build()
}

/// Histogram: time spent waiting for a worker slot.
pub fn slot_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("auditq.slots.wait_ms")
        .with_description("Time from slot request to slot grant")
        .with_unit("ms")
        .build()
}

/// Histogram: analyzer wall time.
/// Labels: `status`.
pub fn analyze_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("auditq.analyze.duration_ms")
        .with_description("Analyzer duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: store write retries.
/// Labels: `result` ("retry" | "gave_up").
pub fn store_write_retries() -> Counter<u64> {
    meter()
        .u64_counter("auditq.store.write_retries")
        .with_description("Retried outcome-store writes")
        .build()
}

/// Counter: writes refused because the item already had a terminal record.
pub fn store_rejected_writes() -> Counter<u64> {
    meter()
        .u64_counter("auditq.store.rejected_writes")
        .with_description("Writes refused over an existing terminal record")
        .build()
}
