//! Error types for batchq.
//!
//! [`Error`] is what a run or an operator command can fail with.
//! Per-item processing failures are [`ItemError`] values instead: they are
//! recorded against the item and never abort a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Source rows or schema declaration do not fit the run's schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The control store could not be read or written.
    #[error("control store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A recoverable failure of one work item.
///
/// Recorded as the item's `last_error` and counted against its retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ItemError {
    pub message: String,
}

impl ItemError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ItemError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ItemError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for ItemError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}
