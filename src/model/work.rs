//! Work items, batches, and run statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ItemError};

/// Ordered name → value mapping used for business and result fields.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Item key
// ---------------------------------------------------------------------------

/// Primary key of a work item, taken from the source row.
///
/// Integer keys sort numerically and before every text key; text keys sort
/// bytewise. The control store orders selection the same way, so a resumed
/// run walks items in the same order as the run it resumes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemKey {
    Int(i64),
    Text(String),
}

impl ItemKey {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ItemKey::Int(n) => Some(*n),
            ItemKey::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ItemKey::Int(_) => None,
            ItemKey::Text(s) => Some(s),
        }
    }

    /// The key as a JSON value, for export.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ItemKey::Int(n) => serde_json::Value::from(*n),
            ItemKey::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKey::Int(n) => write!(f, "{n}"),
            ItemKey::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Integer-looking text becomes [`ItemKey::Int`], so `"12"` read from a
/// file and `12` from JSON name the same item.
impl std::str::FromStr for ItemKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::SchemaMismatch("primary key is empty".into()));
        }
        Ok(trimmed
            .parse::<i64>()
            .map(ItemKey::Int)
            .unwrap_or_else(|_| ItemKey::Text(trimmed.to_string())))
    }
}

impl From<i64> for ItemKey {
    fn from(key: i64) -> Self {
        ItemKey::Int(key)
    }
}

// ---------------------------------------------------------------------------
// Work item
// ---------------------------------------------------------------------------

/// One row of the control store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: ItemKey,

    /// Business fields as imported. Read-only input to processing.
    pub fields: FieldMap,

    /// Result fields. Empty until the item is processed.
    pub results: FieldMap,

    pub is_processed: bool,

    /// Number of recoverable failures recorded so far.
    pub retry_count: u32,

    /// Message of the most recent recoverable failure.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Business field lookup.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Business field as a string slice, if it is one.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// True once the item can no longer be selected.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        !self.is_processed && self.retry_count > max_retries
    }

    pub fn status(&self, max_retries: u32) -> ItemFilter {
        if self.is_processed {
            ItemFilter::Processed
        } else if self.is_exhausted(max_retries) {
            ItemFilter::Exhausted
        } else {
            ItemFilter::Pending
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A bounded, ordered group of items processed in one loop iteration.
///
/// Pure working state: dropped at the end of the iteration, never written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    items: Vec<WorkItem>,
}

impl Batch {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WorkItem> {
        self.items.iter()
    }

    pub fn keys(&self) -> Vec<ItemKey> {
        self.items.iter().map(|item| item.key.clone()).collect()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.key == *key)
    }

    pub fn first_key(&self) -> Option<&ItemKey> {
        self.items.first().map(|item| &item.key)
    }

    pub fn last_key(&self) -> Option<&ItemKey> {
        self.items.last().map(|item| &item.key)
    }

    pub fn into_items(self) -> Vec<WorkItem> {
        self.items
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a WorkItem;
    type IntoIter = std::slice::Iter<'a, WorkItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What processing produced for one item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub key: ItemKey,
    pub result: std::result::Result<FieldMap, ItemError>,
}

impl ItemOutcome {
    pub fn success(key: ItemKey, results: FieldMap) -> Self {
        Self {
            key,
            result: Ok(results),
        }
    }

    pub fn failure(key: ItemKey, error: impl Into<ItemError>) -> Self {
        Self {
            key,
            result: Err(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Progress counts for a run. Every item is in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub processed: u64,
    /// Not processed and still eligible for selection.
    pub pending: u64,
    /// Not processed and out of retries.
    pub exhausted: u64,
}

impl Statistics {
    /// Nothing left to select.
    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} processed={} pending={} exhausted={}",
            self.total, self.processed, self.pending, self.exhausted
        )
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Which items to list or export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemFilter {
    #[default]
    All,
    Processed,
    Pending,
    Exhausted,
}

impl std::fmt::Display for ItemFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemFilter::All => "all",
            ItemFilter::Processed => "processed",
            ItemFilter::Pending => "pending",
            ItemFilter::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ItemFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ItemFilter::All),
            "processed" => Ok(ItemFilter::Processed),
            "pending" => Ok(ItemFilter::Pending),
            "exhausted" => Ok(ItemFilter::Exhausted),
            other => Err(Error::Other(format!("unknown item filter: {other}"))),
        }
    }
}
