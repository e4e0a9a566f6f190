//! Run and batch span helpers.
//!
//! Provides span creation and state-transition recording for runs
//! flowing through the engine.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one invocation of a run.
pub fn start_run_span(run: &str, invocation: &Uuid) -> Span {
    tracing::info_span!(
        "batch.run",
        "batch.run" = run,
        "batch.invocation" = %invocation,
        "batch.state" = tracing::field::Empty,
    )
}

/// Start a span for one batch. Outcome counts are declared empty and
/// filled by [`record_batch_outcome`].
pub fn start_batch_span(run: &str, number: u64, size: usize) -> Span {
    tracing::info_span!(
        "batch.execute",
        "batch.run" = run,
        "batch.number" = number,
        "batch.size" = size,
        "batch.succeeded" = tracing::field::Empty,
        "batch.failed" = tracing::field::Empty,
    )
}

/// Record write-back counts on a batch span.
pub fn record_batch_outcome(span: &Span, succeeded: u64, failed: u64) {
    span.record("batch.succeeded", succeeded);
    span.record("batch.failed", failed);
}

/// Record a run state transition on the run span.
///
/// Emits a tracing `debug` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("batch.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
