//! The batch loop: import, select, process, write back, until done.

use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

use super::processor::{BatchProcessor, ProcessContext};
use super::state::RunState;
use crate::cache::ResultCache;
use crate::config::RunConfig;
use crate::error::{Error, ItemError, Result};
use crate::export::{ExportFormat, export_items};
use crate::model::{Batch, ItemFilter, ItemKey, ItemOutcome, Schema, Statistics};
use crate::pool::panic_message;
use crate::source::DataSource;
use crate::store::{ControlStore, ImportMode, ImportSummary};
use crate::telemetry::batch::{
    record_batch_outcome, record_state_transition, start_batch_span, start_run_span,
};
use crate::telemetry::metrics;

/// Knobs for a single invocation of [`BatchEngine::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after this many batches, at a batch boundary.
    pub max_batches: Option<usize>,
}

impl RunOptions {
    pub fn max_batches(max_batches: usize) -> Self {
        Self {
            max_batches: Some(max_batches),
        }
    }
}

/// What one invocation of [`BatchEngine::run`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub invocation: Uuid,
    pub run_name: String,
    pub import: ImportSummary,
    /// Batches written back by this invocation.
    pub batches: u64,
    /// Items marked processed by this invocation.
    pub succeeded: u64,
    /// Recoverable failures recorded by this invocation.
    pub failed: u64,
    /// Items that used up their last retry during this invocation.
    pub exhausted: Vec<ItemKey>,
    /// The batch limit ended the invocation with work still pending.
    pub stopped_early: bool,
    pub duration: Duration,
    /// Store-wide counts for the run after the last write-back.
    pub statistics: Statistics,
}

impl RunReport {
    /// Nothing pending and not cut short.
    pub fn is_complete(&self) -> bool {
        !self.stopped_early && self.statistics.is_settled()
    }
}

/// Drives one named run through a [`BatchProcessor`].
///
/// Holds no progress of its own: every decision is made from the control
/// store, so a fresh engine over the same store resumes where a previous
/// one stopped.
pub struct BatchEngine<P> {
    store: ControlStore,
    processor: P,
    config: RunConfig,
    cache: Option<Arc<ResultCache<Value>>>,
    state: RunState,
}

impl<P: BatchProcessor> BatchEngine<P> {
    pub fn new(store: ControlStore, processor: P, config: RunConfig) -> Result<Self> {
        config.validate()?;
        let cache = ProcessContext::build_cache(&config)?;
        Ok(Self {
            store,
            processor,
            config,
            cache,
            state: RunState::NotStarted,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &ControlStore {
        &self.store
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// The result cache shared by every batch of this engine. It outlives
    /// individual runs, so a resumed invocation starts warm.
    pub fn cache(&self) -> Option<&Arc<ResultCache<Value>>> {
        self.cache.as_ref()
    }

    /// Progress counts for this engine's run.
    pub async fn statistics(&self) -> Result<Statistics> {
        self.store
            .statistics(&self.config.run_name, self.config.max_retries)
            .await
    }

    /// Export this run's items. Returns the number of rows written.
    pub async fn export<W: Write>(
        &self,
        filter: ItemFilter,
        format: ExportFormat,
        writer: W,
    ) -> Result<u64> {
        let items = self
            .store
            .items(&self.config.run_name, filter, self.config.max_retries, None)
            .await?;
        let schema = self.schema().await?;
        export_items(&items, &schema, format, writer)
    }

    /// Import `source` and process until nothing is left to select.
    ///
    /// Every call starts from [`RunState::NotStarted`]. Item failures are
    /// recorded and retried; only store, schema, or source errors end the
    /// call early, and everything written before that point stays written.
    pub async fn run<S>(
        &mut self,
        source: &S,
        mode: ImportMode,
        options: RunOptions,
    ) -> Result<RunReport>
    where
        S: DataSource + ?Sized,
    {
        let invocation = Uuid::new_v4();
        let span = start_run_span(&self.config.run_name, &invocation);
        self.state = RunState::NotStarted;
        self.run_inner(source, mode, options, invocation, &span)
            .instrument(span.clone())
            .await
    }

    async fn run_inner<S>(
        &mut self,
        source: &S,
        mode: ImportMode,
        options: RunOptions,
        invocation: Uuid,
        span: &Span,
    ) -> Result<RunReport>
    where
        S: DataSource + ?Sized,
    {
        let started = Instant::now();
        let run = self.config.run_name.clone();
        let schema = self.processor.define_schema();
        schema.validate()?;

        self.transition(span, RunState::Importing)?;
        let rows = source.load_rows()?;
        if self.store.has_rows(&run).await? {
            self.transition(span, RunState::AwaitingUserChoice)?;
            info!(run = %run, %mode, "run has prior data");
        }
        let import = self.store.import_source(&run, &schema, &rows, mode).await?;
        self.store
            .set_max_retries(&run, self.config.max_retries)
            .await?;

        let ctx = ProcessContext::new(self.config.clone(), self.cache.clone());
        let labels = [KeyValue::new("run", run.clone())];
        let mut report = RunReport {
            invocation,
            run_name: run.clone(),
            import,
            batches: 0,
            succeeded: 0,
            failed: 0,
            exhausted: Vec::new(),
            stopped_early: false,
            duration: Duration::ZERO,
            statistics: Statistics::default(),
        };

        loop {
            self.transition(span, RunState::Selecting)?;
            let batch = self
                .store
                .select_next_batch(&run, self.config.batch_size, self.config.max_retries)
                .await?;
            if batch.is_empty() {
                break;
            }
            if options
                .max_batches
                .is_some_and(|limit| report.batches >= limit as u64)
            {
                report.stopped_early = true;
                info!(run = %run, batches = report.batches, "batch limit reached");
                break;
            }

            let batch_started = Instant::now();
            let batch_span = start_batch_span(&run, report.batches + 1, batch.len());

            self.transition(span, RunState::Processing)?;
            let outcomes = self
                .process_batch(&batch, &schema, &ctx)
                .instrument(batch_span.clone())
                .await;

            self.transition(span, RunState::WritingBack)?;
            let written = self
                .store
                .write_back(&run, &outcomes, self.config.max_retries)
                .instrument(batch_span.clone())
                .await?;
            record_batch_outcome(&batch_span, written.succeeded, written.failed);

            report.batches += 1;
            report.succeeded += written.succeeded;
            report.failed += written.failed;

            metrics::batches().add(1, &labels);
            metrics::items_processed().add(written.succeeded, &labels);
            metrics::items_failed().add(written.failed, &labels);
            metrics::items_exhausted().add(written.exhausted.len() as u64, &labels);
            metrics::batch_duration_ms()
                .record(batch_started.elapsed().as_secs_f64() * 1000.0, &labels);

            for key in &written.exhausted {
                let last_error = outcomes
                    .iter()
                    .find(|o| o.key == *key)
                    .and_then(|o| o.result.as_ref().err())
                    .map(|e| e.message.as_str())
                    .unwrap_or_default();
                warn!(run = %run, item = %key, error = last_error, "item exhausted its retries");
            }
            report.exhausted.extend(written.exhausted);

            let stats = self.statistics().await?;
            info!(
                run = %run,
                batch = report.batches,
                first = ?batch.first_key().map(ToString::to_string),
                last = ?batch.last_key().map(ToString::to_string),
                succeeded = written.succeeded,
                failed = written.failed,
                statistics = %stats,
                "batch written"
            );
        }

        self.transition(span, RunState::Done)?;
        report.statistics = self.statistics().await?;
        report.duration = started.elapsed();
        info!(
            run = %run,
            batches = report.batches,
            stopped_early = report.stopped_early,
            statistics = %report.statistics,
            elapsed_ms = report.duration.as_millis() as u64,
            "run finished"
        );
        Ok(report)
    }

    /// Turn one batch into exactly one outcome per item.
    async fn process_batch(
        &self,
        batch: &Batch,
        schema: &Schema,
        ctx: &ProcessContext,
    ) -> Vec<ItemOutcome> {
        let fetched = AssertUnwindSafe(self.processor.fetch_external_data(batch, ctx))
            .catch_unwind()
            .await;
        let external = match fetched {
            Ok(Ok(external)) => external,
            Ok(Err(err)) => {
                warn!(items = batch.len(), error = %err, "fetching external data failed");
                return fail_all(batch, &err);
            }
            Err(panic) => {
                let err = ItemError::new(format!(
                    "fetching external data panicked: {}",
                    panic_message(panic.as_ref())
                ));
                warn!(items = batch.len(), error = %err, "fetching external data panicked");
                return fail_all(batch, &err);
            }
        };

        let processed = AssertUnwindSafe(self.processor.process(batch, external, ctx))
            .catch_unwind()
            .await;
        let mut results = match processed {
            Ok(results) => results,
            Err(panic) => {
                let err = ItemError::new(format!(
                    "processing panicked: {}",
                    panic_message(panic.as_ref())
                ));
                warn!(items = batch.len(), error = %err, "processing panicked");
                return fail_all(batch, &err);
            }
        };

        let outcomes = batch
            .iter()
            .map(|item| match results.remove(&item.key) {
                None => ItemOutcome::failure(item.key.clone(), "no result returned for item"),
                Some(Err(err)) => ItemOutcome::failure(item.key.clone(), err),
                Some(Ok(fields)) => {
                    let missing = schema.missing_results(&fields);
                    if missing.is_empty() {
                        ItemOutcome::success(item.key.clone(), schema.project_results(&fields))
                    } else {
                        ItemOutcome::failure(
                            item.key.clone(),
                            format!("result is missing fields: {}", missing.join(", ")),
                        )
                    }
                }
            })
            .collect();

        if !results.is_empty() {
            debug!(
                ignored = results.len(),
                "processor returned results for items outside the batch"
            );
        }
        outcomes
    }

    async fn schema(&self) -> Result<Schema> {
        match self.store.run_schema(&self.config.run_name).await? {
            Some(schema) => Ok(schema),
            None => Ok(self.processor.define_schema()),
        }
    }

    fn transition(&mut self, span: &Span, to: RunState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        record_state_transition(span, &from.to_string(), &to.to_string());
        self.state = to;
        Ok(())
    }
}

fn fail_all(batch: &Batch, err: &ItemError) -> Vec<ItemOutcome> {
    batch
        .iter()
        .map(|item| ItemOutcome::failure(item.key.clone(), err.clone()))
        .collect()
}
