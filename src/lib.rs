//! # batchq
//!
//! Resumable batch execution over a SQLite control store.
//!
//! Source rows are imported into the store once per run, tagged
//! unprocessed. The engine then selects small batches of unprocessed items,
//! hands them to a user-supplied [`engine::BatchProcessor`], and writes each
//! batch's results back before selecting the next. An interrupted run picks
//! up where it stopped; failing items are retried a bounded number of times.
//!
//! Also provides a bounded worker pool, a result cache for external calls,
//! CSV / JSON-lines export, and OpenTelemetry observability.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod model;
pub mod pool;
pub mod source;
pub mod store;
pub mod telemetry;

pub use engine::{BatchEngine, BatchProcessor, ProcessContext, RunOptions, RunReport, RunState};
pub use error::{Error, ItemError, Result};
pub use store::{ControlStore, ImportMode};
