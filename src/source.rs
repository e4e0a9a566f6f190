//! Data sources: where a run's rows come from.
//!
//! A source hands the engine every row at once. It must be deterministic:
//! loading twice yields the same rows, since a resumed run re-reads the
//! source and relies on primary keys to skip what it already has.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::FieldMap;

/// One source row: column name → value, in column order.
pub type SourceRow = FieldMap;

pub trait DataSource {
    fn load_rows(&self) -> Result<Vec<SourceRow>>;
}

/// Rows already in memory.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    rows: Vec<SourceRow>,
}

impl VecSource {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self { rows }
    }

    /// Build from JSON objects; anything else is a `SchemaMismatch`.
    pub fn from_json<I>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = Value>,
    {
        let rows = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                Value::Object(row) => Ok(row),
                other => Err(Error::SchemaMismatch(format!(
                    "row {index} is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl DataSource for VecSource {
    fn load_rows(&self) -> Result<Vec<SourceRow>> {
        Ok(self.rows.clone())
    }
}

/// A delimited text file with a header line. Tab-separated by default.
///
/// Cells that read as integers or finite floats become JSON numbers,
/// empty cells become `null`, everything else stays a string.
#[derive(Debug, Clone)]
pub struct DelimitedFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl DelimitedFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b'\t',
        }
    }

    /// Use another single-byte delimiter (e.g. `','`).
    pub fn delimiter(mut self, delimiter: char) -> Result<Self> {
        self.delimiter = u8::try_from(delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| Error::Config(format!("delimiter {delimiter:?} is not ASCII")))?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for DelimitedFileSource {
    fn load_rows(&self) -> Result<Vec<SourceRow>> {
        let file = File::open(&self.path).map_err(|e| {
            Error::Config(format!("failed to open {}: {e}", self.path.display()))
        })?;
        let rows = read_delimited(BufReader::new(file), self.delimiter)?;
        debug!(path = %self.path.display(), rows = rows.len(), "source loaded");
        Ok(rows)
    }
}

/// Parse delimited text with a header line into rows.
pub fn read_delimited<R: Read>(reader: R, delimiter: u8) -> Result<Vec<SourceRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| (name.clone(), parse_cell(cell)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn parse_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    Value::String(cell.to_string())
}
