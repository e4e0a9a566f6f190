//! Batch engine: import, checkpoint-aware selection, processing, write-back.
//!
//! The loop is sequential, one batch at a time. Parallelism, if any, lives
//! inside a processor (see [`ProcessContext::pool_builder`]).

pub mod processor;
pub mod runner;
pub mod state;

pub use processor::{BatchProcessor, BatchResults, ExternalData, ProcessContext};
pub use runner::{BatchEngine, RunOptions, RunReport};
pub use state::RunState;
