//! The processing strategy a run is driven through.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheKey, ResultCache};
use crate::config::RunConfig;
use crate::error::{ItemError, Result};
use crate::model::{Batch, FieldMap, ItemKey, Schema};
use crate::pool::WorkerPoolBuilder;

/// Per-item data gathered before processing, keyed by item.
pub type ExternalData = BTreeMap<ItemKey, Value>;

/// What processing produced, keyed by item.
///
/// Items of the batch with no entry count as failed.
pub type BatchResults = BTreeMap<ItemKey, std::result::Result<FieldMap, ItemError>>;

/// User-supplied business logic.
///
/// The engine calls `fetch_external_data` then `process` once per batch.
/// Both may be called again for the same items: after a failure, and when
/// an interrupted run resumes before a batch was written back. Results are
/// written at least once, so side effects outside the returned map should
/// be idempotent.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    /// Field layout of the run.
    fn define_schema(&self) -> Schema;

    /// Gather external inputs for a batch. An error fails every item of
    /// the batch.
    async fn fetch_external_data(
        &self,
        _batch: &Batch,
        _ctx: &ProcessContext,
    ) -> std::result::Result<ExternalData, ItemError> {
        Ok(ExternalData::new())
    }

    /// Compute results for a batch. A panic fails every item of the batch.
    async fn process(&self, batch: &Batch, external: ExternalData, ctx: &ProcessContext)
    -> BatchResults;
}

/// What a processor can reach besides the batch itself.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    config: RunConfig,
    cache: Option<Arc<ResultCache<Value>>>,
}

impl ProcessContext {
    pub fn new(config: RunConfig, cache: Option<Arc<ResultCache<Value>>>) -> Self {
        Self { config, cache }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run_name(&self) -> &str {
        &self.config.run_name
    }

    /// The run's result cache, if caching is enabled.
    pub fn cache(&self) -> Option<&Arc<ResultCache<Value>>> {
        self.cache.as_ref()
    }

    /// Call `fetch` through the cache, keyed by `args`. Without a cache
    /// this is just `fetch()`.
    pub async fn cached<A, F, Fut>(
        &self,
        args: &A,
        fetch: F,
    ) -> std::result::Result<Value, ItemError>
    where
        A: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, ItemError>>,
    {
        let Some(cache) = &self.cache else {
            return fetch().await;
        };
        let key = CacheKey::from_args(args).map_err(|e| ItemError::new(e.to_string()))?;
        cache.get_or_insert_with(key, fetch).await
    }

    /// A pool builder sized and named for this run.
    pub fn pool_builder(&self) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
            .workers(self.config.pool_size)
            .name(self.config.run_name.clone())
    }

    /// Build the run's cache from its config.
    pub(crate) fn build_cache(config: &RunConfig) -> Result<Option<Arc<ResultCache<Value>>>> {
        Ok(ResultCache::from_config(&config.cache)?.map(Arc::new))
    }
}
