//! Avro object container decoder

use apache_avro::types::Value as AvroValue;
use apache_avro::Reader;
use dwh_common::{Table, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{
    datetime_from_days, datetime_from_micros, datetime_from_millis, datetime_or_null,
    records_to_table, DecodeError, SourceDecoder,
};

/// Decodes Avro container files whose items are records
#[derive(Debug, Clone, Copy, Default)]
pub struct AvroDecoder;

impl SourceDecoder for AvroDecoder {
    fn decode(&self, path: &Path) -> Result<Table, DecodeError> {
        let file = File::open(path)?;
        let reader = Reader::new(BufReader::new(file)).map_err(DecodeError::format)?;

        let mut records = Vec::new();
        for item in reader {
            match item.map_err(DecodeError::format)? {
                AvroValue::Record(fields) => records.push(
                    fields
                        .into_iter()
                        .map(|(name, value)| (name, avro_to_value(value)))
                        .collect(),
                ),
                other => {
                    return Err(DecodeError::Format(format!(
                        "expected record items, found {:?}",
                        other
                    )))
                },
            }
        }
        Ok(records_to_table(records))
    }
}

fn avro_to_value(value: AvroValue) -> Value {
    match value {
        AvroValue::Null => Value::Null,
        AvroValue::Boolean(b) => Value::Bool(b),
        AvroValue::Int(i) => Value::Int(i64::from(i)),
        AvroValue::Long(l) => Value::Int(l),
        AvroValue::Float(f) => Value::Float(f64::from(f)),
        AvroValue::Double(d) => Value::Float(d),
        AvroValue::String(s) => Value::String(s),
        AvroValue::Enum(_, symbol) => Value::String(symbol),
        AvroValue::Union(_, inner) => avro_to_value(*inner),
        AvroValue::Date(days) => datetime_or_null(datetime_from_days(days)),
        AvroValue::TimestampMillis(ms) => datetime_or_null(datetime_from_millis(ms)),
        AvroValue::TimestampMicros(us) => datetime_or_null(datetime_from_micros(us)),
        AvroValue::Uuid(uuid) => Value::String(uuid.to_string()),
        other => Value::String(format!("{:?}", other)),
    }
}
