//! Delimited text (CSV) decoder

use dwh_common::Table;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{header_name, infer_scalar, unique_headers, DecodeError, SourceDecoder};

/// Decodes delimited text with a header row
#[derive(Debug, Clone)]
pub struct CsvDecoder {
    delimiter: u8,
}

impl CsvDecoder {
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for CsvDecoder {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl SourceDecoder for CsvDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_reader(BufReader::new(file));

        let columns = unique_headers(
            reader
                .headers()
                .map_err(csv_error)?
                .iter()
                .enumerate()
                .map(|(i, raw)| header_name(raw, i))
                .collect(),
        )?;

        let mut table = Table::new(columns);
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            table.push_row(record.iter().map(infer_scalar).collect());
        }
        Ok(table)
    }
}

fn csv_error(err: csv::Error) -> DecodeError {
    if err.is_io_error() {
        if let csv::ErrorKind::Io(io) = err.into_kind() {
            return DecodeError::Io(io);
        }
        return DecodeError::Format("csv i/o failure".to_string());
    }
    DecodeError::format(err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dwh_common::Value;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_decodes_index_column_and_types() {
        let file = write_temp(",id,name,zip_code\n0,1,Ada,01234\n1,2,Bob,\n");
        let table = CsvDecoder::default().decode(file.path()).unwrap();

        assert_eq!(table.columns, vec!["Unnamed: 0", "id", "name", "zip_code"]);
        assert_eq!(table.rows[0][1], Value::Int(1));
        assert_eq!(table.rows[0][2], Value::from("Ada"));
        assert_eq!(table.rows[0][3], Value::Int(1234));
        assert_eq!(table.rows[1][3], Value::Null);
    }

    #[test]
    fn test_ragged_rows_are_format_errors() {
        let file = write_temp("id,name\n1,Ada,extra\n");
        let err = CsvDecoder::default().decode(file.path()).unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
    }

    #[test]
    fn test_duplicate_header_is_format_error() {
        let file = write_temp("id,name,id\n1,Ada,2\n");
        let err = CsvDecoder::default().decode(file.path()).unwrap_err();
        assert!(matches!(err, DecodeError::Format(ref m) if m.contains("duplicate column")));
    }

    #[test]
    fn test_custom_delimiter() {
        let file = write_temp("id;price\n1;2.5\n");
        let table = CsvDecoder::with_delimiter(b';').decode(file.path()).unwrap();
        assert_eq!(table.rows[0], vec![Value::Int(1), Value::Float(2.5)]);
    }
}
