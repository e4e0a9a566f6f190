//! Per-run settings, loaded from TOML or built in code.
//!
//! ```toml
//! [run]
//! run_name = "geocode-2024"
//! batch_size = 50
//! max_retries = 2
//! pool_size = 8
//!
//! [run.cache]
//! enabled = true
//! capacity = 5000
//!
//! [source]
//! path = "data/cities.tsv"
//! delimiter = "\t"
//!
//! [schema]
//! primary_key = "id"
//! business_fields = ["city", "country"]
//! result_fields = ["lat", "lon"]
//! ```

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::model::Schema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Retries allowed after the first attempt when nothing else says otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Settings the engine needs for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Scopes every control-store row; resuming means reusing the name.
    pub run_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Workers available to processing strategies that use a pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_pool_size() -> usize {
    5
}

impl RunConfig {
    /// Defaults for everything but the run name.
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            cache: CacheConfig::default(),
            pool_size: default_pool_size(),
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Load a run config from a TOML file holding a `[run]` table.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(ProjectConfig::load(path)?.run)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.run_name.trim().is_empty() {
            return Err(Error::Config("run_name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be greater than zero".into()));
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(Error::Config(
                "cache.capacity must be greater than zero when the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Where the CLI reads source rows from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

fn default_delimiter() -> char {
    '\t'
}

/// A whole project file: run settings plus, optionally, where the data
/// lives and what shape it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub run: RunConfig,
    pub source: Option<SourceConfig>,
    pub schema: Option<Schema>,
}

impl ProjectConfig {
    /// Parse and validate a project file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ProjectConfig = toml::from_str(content)?;
        config.run.validate()?;
        if let Some(schema) = &config.schema {
            schema.validate()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config = ProjectConfig::from_toml("[run]\nrun_name = \"r\"\n").unwrap();
        assert_eq!(config.run, RunConfig::new("r"));
        assert_eq!(config.run.batch_size, 100);
        assert_eq!(config.run.max_retries, 3);
        assert_eq!(config.run.pool_size, 5);
        assert!(config.run.cache.enabled);
        assert_eq!(config.run.cache.capacity, 1000);
        assert!(config.source.is_none());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = RunConfig::new("r").batch_size(0).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_capacity_only_matters_when_cache_enabled() {
        let off = CacheConfig {
            enabled: false,
            capacity: 0,
        };
        assert!(RunConfig::new("r").cache(off).validate().is_ok());

        let on = CacheConfig {
            enabled: true,
            capacity: 0,
        };
        assert!(RunConfig::new("r").cache(on).validate().is_err());
    }

    #[test]
    fn source_delimiter_defaults_to_tab() {
        let config = ProjectConfig::from_toml(
            "[run]\nrun_name = \"r\"\n[source]\npath = \"rows.tsv\"\n",
        )
        .unwrap();
        assert_eq!(config.source.unwrap().delimiter, '\t');
    }
}
