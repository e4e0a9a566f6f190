//! Export control-store rows to CSV or JSON lines.
//!
//! Columns: primary key, business fields (declared ones first, then any
//! extra source columns in first-seen order), result fields, then the
//! `is_processed` and `retry_count` control fields. Which rows go out is
//! the caller's choice, through [`ItemFilter`](crate::model::ItemFilter).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::schema::{IS_PROCESSED, RETRY_COUNT};
use crate::model::{FieldMap, Schema, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Csv,
    JsonLines,
}

impl ExportFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "cannot infer export format from {}",
                    path.display()
                ))
            })?;
        ext.to_ascii_lowercase().parse()
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExportFormat::Csv => "csv",
            ExportFormat::JsonLines => "jsonl",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "csv" => Ok(ExportFormat::Csv),
            "jsonl" | "json" | "ndjson" => Ok(ExportFormat::JsonLines),
            other => Err(Error::Config(format!("unknown export format: {other}"))),
        }
    }
}

/// Write `items` to `writer`. Returns the number of rows written.
pub fn export_items<W: Write>(
    items: &[WorkItem],
    schema: &Schema,
    format: ExportFormat,
    writer: W,
) -> Result<u64> {
    let columns = Columns::new(items, schema);
    match format {
        ExportFormat::Csv => write_csv(items, &columns, writer),
        ExportFormat::JsonLines => write_json_lines(items, &columns, writer),
    }
}

/// Write `items` to a file, replacing it if it exists.
pub fn export_to_path(
    items: &[WorkItem],
    schema: &Schema,
    format: ExportFormat,
    path: &Path,
) -> Result<u64> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let written = export_items(items, schema, format, &mut writer)?;
    writer.flush()?;
    info!(path = %path.display(), %format, rows = written, "export written");
    Ok(written)
}

struct Columns {
    primary_key: String,
    business: Vec<String>,
    results: Vec<String>,
}

impl Columns {
    fn new(items: &[WorkItem], schema: &Schema) -> Self {
        let mut business = schema.business_fields.clone();
        for item in items {
            for name in item.fields.keys() {
                if !business.contains(name) {
                    business.push(name.clone());
                }
            }
        }
        Self {
            primary_key: schema.primary_key.clone(),
            business,
            results: schema.result_fields.clone(),
        }
    }

    fn header(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_key.as_str())
            .chain(self.business.iter().map(String::as_str))
            .chain(self.results.iter().map(String::as_str))
            .chain([IS_PROCESSED, RETRY_COUNT])
    }

    fn row(&self, item: &WorkItem) -> FieldMap {
        let mut row = FieldMap::new();
        row.insert(self.primary_key.clone(), item.key.to_value());
        for name in &self.business {
            let value = item.fields.get(name).cloned().unwrap_or(Value::Null);
            row.insert(name.clone(), value);
        }
        for name in &self.results {
            let value = item.results.get(name).cloned().unwrap_or(Value::Null);
            row.insert(name.clone(), value);
        }
        row.insert(IS_PROCESSED.to_string(), Value::Bool(item.is_processed));
        row.insert(RETRY_COUNT.to_string(), Value::from(item.retry_count));
        row
    }
}

fn write_csv<W: Write>(items: &[WorkItem], columns: &Columns, writer: W) -> Result<u64> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(columns.header())?;
    for item in items {
        let row = columns.row(item);
        csv.write_record(row.values().map(csv_cell))?;
    }
    csv.flush()?;
    Ok(items.len() as u64)
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_json_lines<W: Write>(items: &[WorkItem], columns: &Columns, mut writer: W) -> Result<u64> {
    for item in items {
        serde_json::to_writer(&mut writer, &columns.row(item))?;
        writer.write_all(b"\n")?;
    }
    Ok(items.len() as u64)
}
