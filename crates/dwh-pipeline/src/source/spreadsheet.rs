//! Spreadsheet (xls/xlsx/ods) decoder

use calamine::{open_workbook_auto, Data, DataType, Reader};
use dwh_common::{Table, Value};
use std::path::Path;

use super::{header_name, index_placeholder, unique_headers, DecodeError, SourceDecoder};

// Largest magnitude where every integer is exactly representable in f64
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Decodes the first worksheet; the first row is the header
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetDecoder;

impl SourceDecoder for SpreadsheetDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        // calamine folds I/O failures into its own error type
        std::fs::metadata(path)?;

        let mut workbook = open_workbook_auto(path).map_err(DecodeError::format)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| DecodeError::Format("workbook has no worksheets".to_string()))?
            .map_err(DecodeError::format)?;

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            return Ok(Table::default());
        };

        let columns = unique_headers(header_names(header))?;

        let mut table = Table::new(columns);
        for row in rows {
            table.push_row(row.iter().map(cell_to_value).collect());
        }
        Ok(table)
    }
}

fn header_names(header: &[Data]) -> Vec<String> {
    header
        .iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Data::Empty => index_placeholder(i),
            other => header_name(&other.to_string(), i),
        })
        .collect()
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT => Value::Int(*f as i64),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) => Value::String(s.clone()),
        Data::DateTime(_) => cell
            .as_datetime()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cell_mapping() {
        assert_eq!(cell_to_value(&Data::Float(3.0)), Value::Int(3));
        assert_eq!(cell_to_value(&Data::Float(19.99)), Value::Float(19.99));
        assert_eq!(cell_to_value(&Data::Empty), Value::Null);
        assert_eq!(cell_to_value(&Data::String("x".into())), Value::from("x"));
    }

    #[test]
    fn test_duplicate_header_cells_are_rejected() {
        let header = [
            Data::Empty,
            Data::String("id".into()),
            Data::String("id ".into()),
        ];
        let names = header_names(&header);
        assert_eq!(names, vec!["Unnamed: 0", "id", "id"]);
        assert!(matches!(unique_headers(names), Err(DecodeError::Format(_))));
    }

    #[test]
    fn test_missing_workbook_is_io_error() {
        let err = SpreadsheetDecoder
            .decode(Path::new("/nonexistent/supplier.xls"))
            .unwrap_err();
        match err {
            DecodeError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupt_workbook_is_format_error() {
        let mut file = tempfile::Builder::new().suffix(".xlsx").tempfile().unwrap();
        file.write_all(b"not a zip archive").unwrap();
        assert!(matches!(
            SpreadsheetDecoder.decode(file.path()),
            Err(DecodeError::Format(_))
        ));
    }
}
