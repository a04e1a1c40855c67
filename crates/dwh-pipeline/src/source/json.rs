//! JSON document and JSON-lines decoders

use dwh_common::{Table, Value};
use serde_json::Map;
use std::collections::HashMap;
use std::path::Path;

use super::{json_to_value, records_to_table, DecodeError, SourceDecoder};

type JsonObject = Map<String, serde_json::Value>;

/// Decodes a JSON document holding records
///
/// Accepted layouts: an array of objects, an object of columns mapping row
/// labels to values (`{"id": {"0": 1, "1": 2}}`), or an object of column
/// arrays (`{"id": [1, 2]}`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl SourceDecoder for JsonDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        let bytes = std::fs::read(path)?;
        let document: serde_json::Value = serde_json::from_slice(&bytes).map_err(DecodeError::format)?;

        match document {
            serde_json::Value::Array(items) => {
                let records = items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::Object(object) => Ok(object_to_record(object)),
                        other => Err(DecodeError::Format(format!(
                            "expected an object per record, found {}",
                            other
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records_to_table(records))
            },
            serde_json::Value::Object(columns) => columns_to_table(columns),
            other => Err(DecodeError::Format(format!(
                "expected an array or object at the top level, found {}",
                other
            ))),
        }
    }
}

/// Decodes one JSON object per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesDecoder;

impl SourceDecoder for JsonLinesDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        let mut records = Vec::new();
        for line in serde_jsonlines::json_lines::<JsonObject, _>(path)? {
            let object = line.map_err(|err| match err.kind() {
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    DecodeError::format(err)
                },
                _ => DecodeError::Io(err),
            })?;
            records.push(object_to_record(object));
        }
        Ok(records_to_table(records))
    }
}

fn object_to_record(object: JsonObject) -> Vec<(String, Value)> {
    object
        .into_iter()
        .map(|(key, value)| (key, json_to_value(value)))
        .collect()
}

fn columns_to_table(columns: JsonObject) -> Result<Table, DecodeError> {
    let names: Vec<String> = columns.keys().cloned().collect();
    let width = names.len();
    let mut row_index: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<Vec<Value>> = Vec::new();

    for (col_idx, (name, column)) in columns.into_iter().enumerate() {
        let entries: Vec<(String, serde_json::Value)> = match column {
            serde_json::Value::Object(by_label) => by_label.into_iter().collect(),
            serde_json::Value::Array(values) => values
                .into_iter()
                .enumerate()
                .map(|(i, value)| (i.to_string(), value))
                .collect(),
            other => {
                return Err(DecodeError::Format(format!(
                    "column {} is neither an object nor an array: {}",
                    name, other
                )))
            },
        };
        for (label, value) in entries {
            let row = *row_index.entry(label).or_insert_with(|| {
                rows.push(vec![Value::Null; width]);
                rows.len() - 1
            });
            rows[row][col_idx] = json_to_value(value);
        }
    }

    let mut table = Table::new(names);
    for row in rows {
        table.push_row(row);
    }
    Ok(table)
}
