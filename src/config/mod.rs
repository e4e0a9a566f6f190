//! Typed configuration.
//!
//! Two layers, both explicit values handed to whoever needs them:
//! - [`Config`]: process-level settings from environment variables
//!   (store URL, telemetry endpoint, log level). Loaded once at startup.
//! - [`RunConfig`] / [`ProjectConfig`]: per-run settings, built in code or
//!   read from a TOML file, passed to the engine's constructor.

pub mod run;

pub use run::{DEFAULT_MAX_RETRIES, ProjectConfig, RunConfig, SourceConfig};

use crate::error::{Error, Result};
use secrecy::SecretString;

/// Store URL used when `DATABASE_URL` is not set.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://batchq.db";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(
                optional_var("DATABASE_URL")?.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            ),
            otel_endpoint: optional_var("OTEL_ENDPOINT")?,
            log_level: optional_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Read a variable; unset and empty both mean absent.
fn optional_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable {name} is not valid unicode"
        ))),
    }
}
