//! Schema declaration for a run.
//!
//! The control store keeps business data opaque; the schema is what lets
//! import reject rows that would leave processing without its inputs, and
//! what write-back checks before marking an item processed.

use serde::{Deserialize, Serialize};

use super::work::{FieldMap, ItemKey};
use crate::error::{Error, Result};

/// Control field recording whether an item's results were written.
pub const IS_PROCESSED: &str = "is_processed";
/// Control field counting recoverable failures.
pub const RETRY_COUNT: &str = "retry_count";

/// Field layout of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Source column holding the primary key.
    pub primary_key: String,
    /// Business columns every source row must carry. Extra columns are kept.
    #[serde(default)]
    pub business_fields: Vec<String>,
    /// Must name both `is_processed` and `retry_count`.
    #[serde(default = "default_control_fields")]
    pub control_fields: Vec<String>,
    /// Columns written by processing.
    #[serde(default)]
    pub result_fields: Vec<String>,
}

fn default_control_fields() -> Vec<String> {
    vec![IS_PROCESSED.to_string(), RETRY_COUNT.to_string()]
}

impl Schema {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            business_fields: Vec::new(),
            control_fields: default_control_fields(),
            result_fields: Vec::new(),
        }
    }

    pub fn business_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.business_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn result_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.result_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn control_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.control_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Check the declaration itself.
    pub fn validate(&self) -> Result<()> {
        if self.primary_key.trim().is_empty() {
            return Err(Error::SchemaMismatch("primary key name is empty".into()));
        }
        for required in [IS_PROCESSED, RETRY_COUNT] {
            if !self.control_fields.iter().any(|f| f == required) {
                return Err(Error::SchemaMismatch(format!(
                    "control fields must include {required}"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        let names = std::iter::once(&self.primary_key)
            .chain(&self.business_fields)
            .chain(&self.control_fields)
            .chain(&self.result_fields);
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(Error::SchemaMismatch(format!(
                    "field {name} is declared more than once"
                )));
            }
        }
        Ok(())
    }

    /// Split a source row into its key and business fields.
    ///
    /// The key column is removed from the returned fields. Rows may carry
    /// columns beyond the declared business fields, but never a column that
    /// collides with a control or result field.
    pub fn split_row(&self, row: &FieldMap) -> Result<(ItemKey, FieldMap)> {
        let key = match row.get(&self.primary_key) {
            Some(serde_json::Value::Number(n)) => n.as_i64().map(ItemKey::Int).ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "primary key {} = {n} is not an integer",
                    self.primary_key
                ))
            })?,
            Some(serde_json::Value::String(s)) => s.parse::<ItemKey>()?,
            Some(other) => {
                return Err(Error::SchemaMismatch(format!(
                    "primary key {} has unsupported value {other}",
                    self.primary_key
                )));
            }
            None => {
                return Err(Error::SchemaMismatch(format!(
                    "row is missing primary key {}",
                    self.primary_key
                )));
            }
        };

        if let Some(missing) = self
            .business_fields
            .iter()
            .find(|field| !row.contains_key(field.as_str()))
        {
            return Err(Error::SchemaMismatch(format!(
                "row {key} is missing business field {missing}"
            )));
        }

        if let Some(reserved) = row.keys().find(|column| {
            self.control_fields.contains(column) || self.result_fields.contains(column)
        }) {
            return Err(Error::SchemaMismatch(format!(
                "row {key} carries reserved column {reserved}"
            )));
        }

        let fields = row
            .iter()
            .filter(|(column, _)| **column != self.primary_key)
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        Ok((key, fields))
    }

    /// Declared result fields absent from `results`.
    pub fn missing_results<'a>(&'a self, results: &FieldMap) -> Vec<&'a str> {
        self.result_fields
            .iter()
            .filter(|field| !results.contains_key(field.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Keep only the declared result fields, in declaration order.
    pub fn project_results(&self, results: &FieldMap) -> FieldMap {
        self.result_fields
            .iter()
            .filter_map(|field| results.get(field).map(|v| (field.clone(), v.clone())))
            .collect()
    }

    /// True when two declarations describe the same stored layout.
    pub fn is_compatible_with(&self, other: &Schema) -> bool {
        self.primary_key == other.primary_key && self.result_fields == other.result_fields
    }
}
