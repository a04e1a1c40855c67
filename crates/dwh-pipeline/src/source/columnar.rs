//! Columnar binary (Parquet) decoder

use dwh_common::{Table, Value};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use std::fs::File;
use std::path::Path;

use super::{
    datetime_from_days, datetime_from_micros, datetime_from_millis, datetime_or_null, DecodeError,
    SourceDecoder,
};

/// Decodes Parquet files row by row
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetDecoder;

impl SourceDecoder for ParquetDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file).map_err(DecodeError::format)?;

        let columns: Vec<String> = reader
            .metadata()
            .file_metadata()
            .schema_descr()
            .root_schema()
            .get_fields()
            .iter()
            .map(|field| field.name().to_string())
            .collect();

        let mut table = Table::new(columns);
        for row in reader.get_row_iter(None).map_err(DecodeError::format)? {
            let row = row.map_err(DecodeError::format)?;
            let mut values = vec![Value::Null; table.columns.len()];
            for (name, field) in row.get_column_iter() {
                if let Some(i) = table.columns.iter().position(|c| c == name) {
                    values[i] = field_to_value(field);
                }
            }
            table.push_row(values);
        }
        Ok(table)
    }
}

fn field_to_value(field: &Field) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Byte(v) => Value::Int(i64::from(*v)),
        Field::Short(v) => Value::Int(i64::from(*v)),
        Field::Int(v) => Value::Int(i64::from(*v)),
        Field::Long(v) => Value::Int(*v),
        Field::UByte(v) => Value::Int(i64::from(*v)),
        Field::UShort(v) => Value::Int(i64::from(*v)),
        Field::UInt(v) => Value::Int(i64::from(*v)),
        Field::ULong(v) => i64::try_from(*v)
            .map(Value::Int)
            .unwrap_or(Value::Float(*v as f64)),
        Field::Float(v) => Value::Float(f64::from(*v)),
        Field::Double(v) => Value::Float(*v),
        Field::Str(s) => Value::String(s.clone()),
        Field::Date(days) => datetime_or_null(datetime_from_days(*days)),
        Field::TimestampMillis(ms) => datetime_or_null(datetime_from_millis(*ms)),
        Field::TimestampMicros(us) => datetime_or_null(datetime_from_micros(*us)),
        other => Value::String(other.to_string()),
    }
}
