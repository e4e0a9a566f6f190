//! Core data model.
//!
//! A work item is one row of source data plus the bookkeeping needed to
//! drive it through a run exactly until it succeeds or runs out of retries.
//! The schema says which fields a run expects in and which it writes back.

pub mod schema;
pub mod work;

pub use schema::Schema;
pub use work::{Batch, FieldMap, ItemFilter, ItemKey, ItemOutcome, Statistics, WorkItem};
