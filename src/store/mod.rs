//! Control store: connection pool, migrations, and health check.
//!
//! SQLite through sqlx. The store is the single source of truth for run
//! progress; everything the engine holds in memory can be rebuilt from it.
//! WAL mode so operator reads (status, export) never block the run loop.

pub mod items;

pub use items::{ImportMode, ImportSummary, WriteBackSummary};

use crate::error::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// Control store handle. Owns the connection pool.
#[derive(Clone)]
pub struct ControlStore {
    pool: SqlitePool,
}

impl ControlStore {
    /// Connect to a SQLite database URL (e.g. `sqlite://batch.db`),
    /// creating the file if it does not exist.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        debug!(url, "control store connected");
        Ok(Self { pool })
    }

    /// Open (or create) a database file and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.as_ref().display(), "control store opened");
        Ok(store)
    }

    /// Create an in-memory database (for testing). Migrated on return.
    ///
    /// Pinned to a single connection that never expires, since every new
    /// SQLite in-memory connection is a fresh, empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Run `SELECT 1` against the pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection. Later calls fail with
    /// `StoreUnavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
