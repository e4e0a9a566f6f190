//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchq"` meter. Without
//! an OTLP endpoint the global provider is a no-op and recording is free.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for batchq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: rows written to the control store by an import.
/// Labels: `mode`.
pub fn items_imported() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.imported")
        .with_description("Number of work items imported into the control store")
        .build()
}

/// Counter: items marked processed by write-back.
/// Labels: `run`.
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.processed")
        .with_description("Number of work items processed successfully")
        .build()
}

/// Counter: recoverable item failures recorded by write-back.
/// Labels: `run`.
pub fn items_failed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.failed")
        .with_description("Number of recoverable work item failures")
        .build()
}

/// Counter: items that used up their last retry.
/// Labels: `run`.
pub fn items_exhausted() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.exhausted")
        .with_description("Number of work items that exhausted their retries")
        .build()
}

/// Counter: batches written back.
/// Labels: `run`.
pub fn batches() -> Counter<u64> {
    meter()
        .u64_counter("batchq.batches")
        .with_description("Number of batches processed")
        .build()
}

/// Counter: result cache lookups.
/// Labels: `result` ("hit" | "miss").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("batchq.cache.lookups")
        .with_description("Number of result cache lookups")
        .build()
}

/// Histogram: wall time of one batch (select through write-back).
/// Labels: `run`.
pub fn batch_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.batch.duration_ms")
        .with_description("Batch duration in milliseconds")
        .with_unit("ms")
        .build()
}
