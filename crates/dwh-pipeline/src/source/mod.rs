//! Source file decoders
//!
//! Each supported [`SourceFormat`] has a [`SourceDecoder`] that turns one
//! file into an untyped [`Table`]. Decoders are blocking and are called from
//! the blocking thread pool by the ingest task.
//!
//! The set of decoders lives in a [`DecoderRegistry`] so callers can replace
//! or add decoders without touching the ingest task.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use dwh_common::{DatasetName, SourceFile, SourceFormat, Table, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{PipelineError, SourceReadKind};

mod avro;
mod columnar;
mod delimited;
mod json;
mod spreadsheet;

pub use avro::AvroDecoder;
pub use columnar::ParquetDecoder;
pub use delimited::CsvDecoder;
pub use json::{JsonDecoder, JsonLinesDecoder};
pub use spreadsheet::SpreadsheetDecoder;

/// Values that read as missing in text sources
const NULL_TOKENS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NaN", "nan", "-NaN", "-nan", "NULL", "null", "None", "<NA>", "#N/A",
];

/// Failure while decoding one file
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Format(String),
}

impl DecodeError {
    pub fn format(err: impl std::fmt::Display) -> Self {
        DecodeError::Format(err.to_string())
    }
}

/// Turns a file of one format into rows
pub trait SourceDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError>;
}

/// Format tag to decoder lookup
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<SourceFormat, Arc<dyn SourceDecoder>>,
}

impl DecoderRegistry {
    /// A registry with no decoders
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// A registry with a decoder for every built-in format
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(SourceFormat::JsonLines, JsonLinesDecoder);
        registry.register(SourceFormat::Csv, CsvDecoder::default());
        registry.register(SourceFormat::Json, JsonDecoder);
        registry.register(SourceFormat::Parquet, ParquetDecoder);
        registry.register(SourceFormat::Avro, AvroDecoder);
        registry.register(SourceFormat::Spreadsheet, SpreadsheetDecoder);
        registry
    }

    /// Install `decoder` for `format`, replacing any existing one
    pub fn register(&mut self, format: SourceFormat, decoder: impl SourceDecoder + 'static) {
        self.decoders.insert(format, Arc::new(decoder));
    }

    pub fn get(&self, format: SourceFormat) -> Option<Arc<dyn SourceDecoder>> {
        self.decoders.get(&format).cloned()
    }

    /// Decode `source` for `dataset`, classifying failures for the retry policy
    pub fn decode(&self, dataset: DatasetName, source: &SourceFile) -> Result<Table, PipelineError> {
        let source_error = |kind: SourceReadKind, reason: String| PipelineError::SourceRead {
            dataset,
            path: source.path.clone(),
            kind,
            reason,
        };

        let decoder = self.get(source.format).ok_or_else(|| {
            source_error(
                SourceReadKind::Decode,
                format!("no decoder registered for format {}", source.format),
            )
        })?;

        decoder.decode(&source.path).map_err(|err| match err {
            DecodeError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                source_error(SourceReadKind::NotFound, io.to_string())
            },
            DecodeError::Io(io) => source_error(SourceReadKind::Io, io.to_string()),
            DecodeError::Format(reason) => source_error(SourceReadKind::Decode, reason),
        })
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut formats: Vec<&str> = self.decoders.keys().map(|k| k.as_str()).collect();
        formats.sort();
        f.debug_struct("DecoderRegistry").field("formats", &formats).finish()
    }
}

// ============================================================================
// Shared decoding helpers
// ============================================================================

/// Name given to a blank header cell, matching row-index exports
pub(crate) fn index_placeholder(position: usize) -> String {
    format!("Unnamed: {}", position)
}

/// Header name, substituting the placeholder for blanks
pub(crate) fn header_name(raw: &str, position: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        index_placeholder(position)
    } else {
        trimmed.to_string()
    }
}

/// Header row as column names; a name may appear only once
pub(crate) fn unique_headers(names: Vec<String>) -> Result<Vec<String>, DecodeError> {
    let mut seen = HashSet::with_capacity(names.len());
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(DecodeError::Format(format!("duplicate column name {:?} in header", name)));
        }
    }
    Ok(names)
}

/// Infer a typed value from a text cell
pub(crate) fn infer_scalar(raw: &str) -> Value {
    let text = raw.trim();
    if NULL_TOKENS.contains(&text) {
        return Value::Null;
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if looks_numeric(text) {
        if let Ok(f) = text.parse::<f64>() {
            return Value::Float(f);
        }
    }
    match text {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

// Rejects words f64::from_str accepts ("inf", "infinity")
fn looks_numeric(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

pub(crate) fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        serde_json::Value::String(s) => Value::String(s),
        nested => Value::String(nested.to_string()),
    }
}

/// Build a table from keyed records; columns appear in first-seen order and
/// keys absent from a record read as null
pub(crate) fn records_to_table(records: Vec<Vec<(String, Value)>>) -> Table {
    let mut columns: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for record in &records {
        for (key, _) in record {
            if !positions.contains_key(key) {
                positions.insert(key.clone(), columns.len());
                columns.push(key.clone());
            }
        }
    }

    let mut table = Table::new(columns);
    for record in records {
        let mut row = vec![Value::Null; positions.len()];
        for (key, value) in record {
            if let Some(&i) = positions.get(&key) {
                row[i] = value;
            }
        }
        table.push_row(row);
    }
    table
}

pub(crate) fn datetime_from_epoch(secs: i64, nanos: u32) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

pub(crate) fn datetime_from_millis(millis: i64) -> Option<NaiveDateTime> {
    datetime_from_epoch(
        millis.div_euclid(1_000),
        (millis.rem_euclid(1_000) * 1_000_000) as u32,
    )
}

pub(crate) fn datetime_from_micros(micros: i64) -> Option<NaiveDateTime> {
    datetime_from_epoch(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}

pub(crate) fn datetime_from_days(days: i32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1970, 1, 1)?
        .checked_add_signed(chrono::Duration::days(i64::from(days)))?
        .and_hms_opt(0, 0, 0)
}

/// Value for a timestamp-like cell, falling back to null when out of range
pub(crate) fn datetime_or_null(dt: Option<NaiveDateTime>) -> Value {
    dt.map(Value::DateTime).unwrap_or(Value::Null)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_unique_headers() {
        let names = vec!["Unnamed: 0".to_string(), "id".to_string()];
        assert_eq!(unique_headers(names.clone()).unwrap(), names);

        let err = unique_headers(vec!["id".into(), "name".into(), "id".into()]).unwrap_err();
        assert!(matches!(err, DecodeError::Format(ref m) if m.contains("\"id\"")));
    }

    #[test]
    fn test_infer_scalar() {
        assert_eq!(infer_scalar("42"), Value::Int(42));
        assert_eq!(infer_scalar("19.99"), Value::Float(19.99));
        assert_eq!(infer_scalar(""), Value::Null);
        assert_eq!(infer_scalar("NaN"), Value::Null);
        assert_eq!(infer_scalar("True"), Value::Bool(true));
        assert_eq!(infer_scalar("inf"), Value::from("inf"));
        assert_eq!(infer_scalar("2023-11-21"), Value::from("2023-11-21"));
    }

    #[test]
    fn test_header_placeholder() {
        assert_eq!(header_name("  ", 0), "Unnamed: 0");
        assert_eq!(header_name("id", 1), "id");
    }

    #[test]
    fn test_records_to_table_unions_keys() {
        let table = records_to_table(vec![
            vec![("id".into(), Value::Int(1))],
            vec![("id".into(), Value::Int(2)), ("email".into(), Value::from("x@y"))],
        ]);
        assert_eq!(table.columns, vec!["id".to_string(), "email".to_string()]);
        assert_eq!(table.rows[0], vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn test_epoch_helpers() {
        let dt = datetime_from_days(19_682).unwrap();
        assert_eq!(dt.to_string(), "2023-11-21 00:00:00");
        assert_eq!(datetime_from_millis(-1).unwrap().to_string(), "1969-12-31 23:59:59.999");
        assert_eq!(
            datetime_from_micros(1_700_524_800_000_000).unwrap().to_string(),
            "2023-11-21 00:00:00"
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let registry = DecoderRegistry::with_builtin();
        let source = SourceFile::new(PathBuf::from("/nonexistent/supplier.csv"), SourceFormat::Csv);
        let err = registry.decode(DatasetName::Suppliers, &source).unwrap_err();
        match err {
            PipelineError::SourceRead { kind, dataset, .. } => {
                assert_eq!(kind, SourceReadKind::NotFound);
                assert_eq!(dataset, DatasetName::Suppliers);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unregistered_format_is_decode_failure() {
        let registry = DecoderRegistry::empty();
        let source = SourceFile::new(PathBuf::from("a.csv"), SourceFormat::Csv);
        let err = registry.decode(DatasetName::Coupons, &source).unwrap_err();
        assert!(!err.is_retryable());
    }
}
