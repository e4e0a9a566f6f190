//! Work item operations: import, batch selection, write-back, statistics.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, QueryBuilder, Sqlite, Type, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::work::{Batch, FieldMap, ItemFilter, ItemKey, ItemOutcome, Statistics, WorkItem};
use crate::model::Schema;
use crate::telemetry::metrics;

/// What to do when a run already has rows in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportMode {
    /// Import only if the run has no rows yet; otherwise touch nothing.
    #[default]
    CreateIfAbsent,
    /// Insert source rows whose key is not stored yet; never touch
    /// existing rows.
    SkipIfExists,
    /// Delete every row of the run and import from scratch.
    Overwrite,
}

impl ImportMode {
    /// Whether this mode keeps the progress of an existing run.
    pub fn resumes(self) -> bool {
        !matches!(self, ImportMode::Overwrite)
    }
}

impl std::fmt::Display for ImportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImportMode::CreateIfAbsent => "create-if-absent",
            ImportMode::SkipIfExists => "skip-if-exists",
            ImportMode::Overwrite => "overwrite",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ImportMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create-if-absent" | "create" => Ok(ImportMode::CreateIfAbsent),
            "skip-if-exists" | "skip" | "resume" => Ok(ImportMode::SkipIfExists),
            "overwrite" => Ok(ImportMode::Overwrite),
            other => Err(Error::Other(format!("unknown import mode: {other}"))),
        }
    }
}

/// Result of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rows read from the source.
    pub source_rows: u64,
    /// Rows written to the store.
    pub inserted: u64,
    /// Source rows left out because the store already had them.
    pub skipped: u64,
    /// Rows deleted by an overwrite.
    pub removed: u64,
    /// Whether the run already had rows when the import started.
    pub existing: bool,
}

/// Result of writing one batch back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBackSummary {
    pub succeeded: u64,
    pub failed: u64,
    /// Outcomes that matched no unprocessed row (unknown key, or the item
    /// was already processed by an earlier write).
    pub skipped: u64,
    /// Items whose failure in this batch used up their last retry.
    pub exhausted: Vec<ItemKey>,
}

const ITEM_COLUMNS: &str =
    "item_key, fields, results, is_processed, retry_count, last_error, created_at, updated_at";

impl super::ControlStore {
    /// Import source rows into a run.
    ///
    /// Every row is checked against the schema before anything is written;
    /// one bad row rejects the whole import with `SchemaMismatch`. The write
    /// itself is a single transaction.
    pub async fn import_source(
        &self,
        run: &str,
        schema: &Schema,
        rows: &[FieldMap],
        mode: ImportMode,
    ) -> Result<ImportSummary> {
        schema.validate()?;

        let mut seen = HashSet::with_capacity(rows.len());
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let (key, fields) = schema.split_row(row)?;
            if !seen.insert(key.clone()) {
                return Err(Error::SchemaMismatch(format!(
                    "primary key {key} appears more than once in the source"
                )));
            }
            prepared.push((key, serde_json::to_string(&fields)?));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let stored: Option<(String,)> = sqlx::query_as("SELECT schema FROM runs WHERE name = ?1")
            .bind(run)
            .fetch_optional(&mut *tx)
            .await?;
        let (existing_rows,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM work_items WHERE run = ?1")
                .bind(run)
                .fetch_one(&mut *tx)
                .await?;

        let mut summary = ImportSummary {
            source_rows: rows.len() as u64,
            existing: existing_rows > 0,
            ..ImportSummary::default()
        };

        if mode.resumes() {
            if let Some((stored,)) = &stored {
                let stored: Schema = serde_json::from_str(stored)?;
                if !stored.is_compatible_with(schema) {
                    return Err(Error::SchemaMismatch(format!(
                        "run {run} was imported with primary key {} and result fields {:?}",
                        stored.primary_key, stored.result_fields
                    )));
                }
            }
            if mode == ImportMode::CreateIfAbsent && summary.existing {
                tx.commit().await?;
                summary.skipped = summary.source_rows;
                info!(run, existing = existing_rows, "run already imported, keeping existing rows");
                return Ok(summary);
            }
        } else {
            summary.removed = sqlx::query("DELETE FROM work_items WHERE run = ?1")
                .bind(run)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        sqlx::query(
            "INSERT INTO runs (name, schema, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (name) DO UPDATE SET schema = excluded.schema, updated_at = excluded.updated_at",
        )
        .bind(run)
        .bind(serde_json::to_string(schema)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (key, fields) in &prepared {
            let inserted = sqlx::query(
                "INSERT INTO work_items (run, item_key, fields, results, is_processed, retry_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '{}', 0, 0, ?4, ?4)
                 ON CONFLICT (run, item_key) DO NOTHING",
            )
            .bind(run)
            .bind(key)
            .bind(fields)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted == 1 {
                summary.inserted += 1;
            } else {
                summary.skipped += 1;
            }
        }

        tx.commit().await?;

        metrics::items_imported().add(summary.inserted, &[KeyValue::new("mode", mode.to_string())]);
        info!(
            run,
            %mode,
            inserted = summary.inserted,
            skipped = summary.skipped,
            removed = summary.removed,
            "import finished"
        );
        Ok(summary)
    }

    /// Whether the run has any rows.
    pub async fn has_rows(&self, run: &str) -> Result<bool> {
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM work_items WHERE run = ?1 LIMIT 1")
                .bind(run)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }

    /// Schema the run was last imported with.
    pub async fn run_schema(&self, run: &str) -> Result<Option<Schema>> {
        let stored: Option<(String,)> = sqlx::query_as("SELECT schema FROM runs WHERE name = ?1")
            .bind(run)
            .fetch_optional(self.pool())
            .await?;
        stored
            .map(|(json,)| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    /// Names of every run in the store.
    pub async fn runs(&self) -> Result<Vec<String>> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM runs ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(names.into_iter().map(|(name,)| name).collect())
    }

    /// Remember the retry budget a run is processed with, so later reports
    /// classify exhausted items the same way the engine did.
    pub async fn set_max_retries(&self, run: &str, max_retries: u32) -> Result<()> {
        let updated = sqlx::query("UPDATE runs SET max_retries = ?1, updated_at = ?2 WHERE name = ?3")
            .bind(i64::from(max_retries))
            .bind(Utc::now())
            .bind(run)
            .execute(self.pool())
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("run {run}")));
        }
        debug!(run, max_retries, "retry budget recorded");
        Ok(())
    }

    /// Retry budget last recorded for a run, if any.
    pub async fn run_max_retries(&self, run: &str) -> Result<Option<u32>> {
        let stored: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT max_retries FROM runs WHERE name = ?1")
                .bind(run)
                .fetch_optional(self.pool())
                .await?;
        stored
            .and_then(|(budget,)| budget)
            .map(|budget| {
                u32::try_from(budget).map_err(|_| {
                    Error::Other(format!("run {run} has corrupt retry budget {budget}"))
                })
            })
            .transpose()
    }

    /// Retry budget for reporting on a run: `requested` if given, else the
    /// recorded one, else `fallback`.
    pub async fn resolve_max_retries(
        &self,
        run: &str,
        requested: Option<u32>,
        fallback: u32,
    ) -> Result<u32> {
        if let Some(requested) = requested {
            return Ok(requested);
        }
        Ok(self.run_max_retries(run).await?.unwrap_or(fallback))
    }

    /// Next batch: unprocessed items with retries left, ascending key.
    ///
    /// Integer keys come before text keys, which is also how [`ItemKey`]
    /// orders. Reads only, so repeated calls without an intervening write return
    /// the same batch. An empty batch means the run has nothing left to do.
    pub async fn select_next_batch(
        &self,
        run: &str,
        batch_size: usize,
        max_retries: u32,
    ) -> Result<Batch> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items
             WHERE run = ?1 AND is_processed = 0 AND retry_count <= ?2
             ORDER BY item_key
             LIMIT ?3"
        ))
        .bind(run)
        .bind(i64::from(max_retries))
        .bind(batch_size as i64)
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect::<Result<Vec<_>>>()?;
        debug!(run, selected = items.len(), "batch selected");
        Ok(Batch::new(items))
    }

    /// Write a batch's outcomes back.
    ///
    /// Each outcome is one `UPDATE` statement, so every item is either fully
    /// written (results and processed flag together) or untouched. There is
    /// no transaction across items: a crash mid-batch leaves some items
    /// written and the rest still pending.
    pub async fn write_back(
        &self,
        run: &str,
        outcomes: &[ItemOutcome],
        max_retries: u32,
    ) -> Result<WriteBackSummary> {
        let mut summary = WriteBackSummary::default();

        for outcome in outcomes {
            let now = Utc::now();
            match &outcome.result {
                Ok(results) => {
                    let affected = sqlx::query(
                        "UPDATE work_items
                         SET results = ?1, is_processed = 1, last_error = NULL, updated_at = ?2
                         WHERE run = ?3 AND item_key = ?4 AND is_processed = 0",
                    )
                    .bind(serde_json::to_string(results)?)
                    .bind(now)
                    .bind(run)
                    .bind(&outcome.key)
                    .execute(self.pool())
                    .await?
                    .rows_affected();

                    if affected == 1 {
                        summary.succeeded += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                Err(error) => {
                    let updated: Option<(i64,)> = sqlx::query_as(
                        "UPDATE work_items
                         SET retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
                         WHERE run = ?3 AND item_key = ?4 AND is_processed = 0
                         RETURNING retry_count",
                    )
                    .bind(&error.message)
                    .bind(now)
                    .bind(run)
                    .bind(&outcome.key)
                    .fetch_optional(self.pool())
                    .await?;

                    match updated {
                        Some((retry_count,)) => {
                            summary.failed += 1;
                            if retry_count > i64::from(max_retries) {
                                summary.exhausted.push(outcome.key.clone());
                            }
                        }
                        None => summary.skipped += 1,
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Progress counts for a run.
    pub async fn statistics(&self, run: &str, max_retries: u32) -> Result<Statistics> {
        let (total, processed, pending, exhausted): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN is_processed = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN is_processed = 0 AND retry_count <= ?2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN is_processed = 0 AND retry_count > ?2 THEN 1 ELSE 0 END), 0)
             FROM work_items WHERE run = ?1",
        )
        .bind(run)
        .bind(i64::from(max_retries))
        .fetch_one(self.pool())
        .await?;

        Ok(Statistics {
            total: total as u64,
            processed: processed as u64,
            pending: pending as u64,
            exhausted: exhausted as u64,
        })
    }

    /// Items of a run in key order.
    ///
    /// `max_retries` decides which unprocessed items count as exhausted.
    pub async fn items(
        &self,
        run: &str,
        filter: ItemFilter,
        max_retries: u32,
        limit: Option<i64>,
    ) -> Result<Vec<WorkItem>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE run = "
        ));
        query.push_bind(run);
        match filter {
            ItemFilter::All => {}
            ItemFilter::Processed => {
                query.push(" AND is_processed = 1");
            }
            ItemFilter::Pending => {
                query.push(" AND is_processed = 0 AND retry_count <= ");
                query.push_bind(i64::from(max_retries));
            }
            ItemFilter::Exhausted => {
                query.push(" AND is_processed = 0 AND retry_count > ");
                query.push_bind(i64::from(max_retries));
            }
        }
        query.push(" ORDER BY item_key");
        if let Some(limit) = limit {
            query.push(" LIMIT ");
            query.push_bind(limit);
        }

        let rows: Vec<WorkItemRow> = query.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    /// Get one item.
    pub async fn get_item(&self, run: &str, key: &ItemKey) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE run = ?1 AND item_key = ?2"
        ))
        .bind(run)
        .bind(key)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {key} in run {run}")))?
            .try_into_work_item()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    item_key: ItemKey,
    fields: String,
    results: String,
    is_processed: bool,
    retry_count: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            key: self.item_key.clone(),
            fields: serde_json::from_str(&self.fields)?,
            results: serde_json::from_str(&self.results)?,
            is_processed: self.is_processed,
            retry_count: u32::try_from(self.retry_count).map_err(|_| {
                Error::Other(format!(
                    "item {} has corrupt retry count {}",
                    self.item_key, self.retry_count
                ))
            })?,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// Keys are stored in an untyped column, so each value keeps the storage
// class it was bound with: INTEGER for numeric keys, TEXT for the rest.

impl Type<Sqlite> for ItemKey {
    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <i64 as Type<Sqlite>>::compatible(ty) || <String as Type<Sqlite>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Sqlite> for ItemKey {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> std::result::Result<IsNull, BoxDynError> {
        match self {
            ItemKey::Int(n) => <i64 as Encode<'q, Sqlite>>::encode_by_ref(n, buf),
            ItemKey::Text(s) => <String as Encode<'q, Sqlite>>::encode_by_ref(s, buf),
        }
    }
}

impl<'r> Decode<'r, Sqlite> for ItemKey {
    fn decode(value: SqliteValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        if value.type_info().name() == "INTEGER" {
            Ok(ItemKey::Int(<i64 as Decode<'r, Sqlite>>::decode(value)?))
        } else {
            Ok(ItemKey::Text(<String as Decode<'r, Sqlite>>::decode(value)?))
        }
    }
}
