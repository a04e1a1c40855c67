//! Declarative per-dataset normalization rules

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use dwh_common::{ColumnType, Dataset, DatasetName, Value};
use regex::Regex;
use std::collections::HashMap;

use crate::error::{PipelineError, Result};
use crate::source::datetime_from_epoch;

/// Header pattern produced by row-indexed exports
const INDEX_COLUMN_PATTERN: &str = r"^Unnamed: \d+$";

const NANOS_PER_SEC: i64 = 1_000_000_000;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// One normalization step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Drop every index placeholder column
    DropIndexColumns,
    /// Cast every value of `column` to `to`
    Coerce { column: String, to: ColumnType },
    /// Keep only the last row for each distinct `key`
    DedupLast { key: Vec<String> },
}

impl Rule {
    pub fn coerce(column: impl Into<String>, to: ColumnType) -> Self {
        Rule::Coerce {
            column: column.into(),
            to,
        }
    }

    pub fn dedup_on(column: impl Into<String>) -> Self {
        Rule::DedupLast {
            key: vec![column.into()],
        }
    }
}

/// Built-in rule list for every dataset
pub fn standard_rules() -> HashMap<DatasetName, Vec<Rule>> {
    use DatasetName::*;

    HashMap::from([
        (
            Coupons,
            vec![Rule::coerce("discount_percent", ColumnType::Float), Rule::dedup_on("id")],
        ),
        (
            Customers,
            vec![
                Rule::DropIndexColumns,
                Rule::coerce("zip_code", ColumnType::String),
                Rule::dedup_on("id"),
            ],
        ),
        (Login, vec![Rule::dedup_on("id")]),
        (OrderItems, vec![Rule::dedup_on("id")]),
        (
            Orders,
            vec![Rule::coerce("created_at", ColumnType::DateTime), Rule::dedup_on("id")],
        ),
        (
            ProductCategories,
            vec![Rule::DropIndexColumns, Rule::dedup_on("id")],
        ),
        (
            Products,
            vec![
                Rule::DropIndexColumns,
                Rule::coerce("name", ColumnType::String),
                Rule::coerce("price", ColumnType::Float),
                Rule::dedup_on("id"),
            ],
        ),
        (Suppliers, vec![Rule::DropIndexColumns, Rule::dedup_on("id")]),
    ])
}

/// Apply `rules` to `dataset` in order
pub fn apply_rules(mut dataset: Dataset, rules: &[Rule]) -> Result<Dataset> {
    for rule in rules {
        dataset = match rule {
            Rule::DropIndexColumns => drop_index_columns(dataset)?,
            Rule::Coerce { column, to } => coerce_column(dataset, column, *to)?,
            Rule::DedupLast { key } => dedup_last(dataset, key)?,
        };
    }
    Ok(dataset)
}

/// Remove index placeholder columns; a no-op when there are none
pub fn drop_index_columns(mut dataset: Dataset) -> Result<Dataset> {
    let pattern = Regex::new(INDEX_COLUMN_PATTERN)
        .map_err(|e| PipelineError::Config(format!("Invalid index column pattern: {}", e)))?;

    let keep: Vec<bool> = dataset
        .schema
        .columns
        .iter()
        .map(|c| !pattern.is_match(&c.name))
        .collect();
    if keep.iter().all(|k| *k) {
        return Ok(dataset);
    }

    dataset.schema.columns = dataset
        .schema
        .columns
        .into_iter()
        .zip(&keep)
        .filter_map(|(column, k)| k.then_some(column))
        .collect();
    for row in &mut dataset.rows {
        let cells = std::mem::take(row);
        *row = cells
            .into_iter()
            .zip(&keep)
            .filter_map(|(value, k)| k.then_some(value))
            .collect();
    }
    Ok(dataset)
}

/// Cast a column; any uncastable value fails the whole dataset
pub fn coerce_column(mut dataset: Dataset, column: &str, to: ColumnType) -> Result<Dataset> {
    let idx = column_index(&dataset, column)?;

    for (row_idx, row) in dataset.rows.iter_mut().enumerate() {
        let Some(cell) = row.get_mut(idx) else {
            continue;
        };
        let cast = coerce_value(cell, to).ok_or_else(|| PipelineError::Coercion {
            dataset: dataset.name,
            column: column.to_string(),
            row: row_idx,
            value: cell.to_string(),
            target: to,
        })?;
        *cell = cast;
    }

    if let Some(col) = dataset.schema.columns.get_mut(idx) {
        col.ty = to;
    }
    Ok(dataset)
}

/// Collapse rows sharing `key`, keeping the last occurrence at its position
pub fn dedup_last(mut dataset: Dataset, key: &[String]) -> Result<Dataset> {
    let indexes = key
        .iter()
        .map(|column| column_index(&dataset, column))
        .collect::<Result<Vec<usize>>>()?;

    let key_of = |row: &[Value]| -> Vec<Value> {
        indexes
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
            .collect()
    };

    let mut last: HashMap<Vec<Value>, usize> = HashMap::with_capacity(dataset.rows.len());
    for (i, row) in dataset.rows.iter().enumerate() {
        last.insert(key_of(row), i);
    }
    if last.len() == dataset.rows.len() {
        return Ok(dataset);
    }

    dataset.rows = dataset
        .rows
        .into_iter()
        .enumerate()
        .filter(|(i, row)| last.get(&key_of(row)) == Some(i))
        .map(|(_, row)| row)
        .collect();
    Ok(dataset)
}

fn column_index(dataset: &Dataset, column: &str) -> Result<usize> {
    dataset
        .schema
        .index_of(column)
        .ok_or_else(|| PipelineError::MissingColumn {
            dataset: dataset.name,
            column: column.to_string(),
        })
}

/// Cast one value, or `None` when it has no representation in `to`
pub fn coerce_value(value: &Value, to: ColumnType) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    match to {
        ColumnType::Null => Some(Value::Null),
        ColumnType::String => Some(Value::String(value.to_string())),
        ColumnType::Float => to_float(value).map(Value::Float),
        ColumnType::Integer => to_integer(value).map(Value::Int),
        ColumnType::Boolean => to_bool(value).map(Value::Bool),
        ColumnType::DateTime => to_datetime(value).map(Value::DateTime),
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(0) => Some(false),
        Value::Int(1) => Some(true),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::Int(nanos) => datetime_from_epoch(
            nanos.div_euclid(NANOS_PER_SEC),
            nanos.rem_euclid(NANOS_PER_SEC) as u32,
        ),
        Value::String(s) => parse_datetime(s.trim()),
        _ => None,
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use dwh_common::Table;
    use proptest::prelude::*;

    fn dataset(name: DatasetName, columns: &[&str], rows: Vec<Vec<Value>>) -> Dataset {
        let mut table = Table::new(columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            table.push_row(row);
        }
        Dataset::from_table(name, table)
    }

    fn rules_for(name: DatasetName) -> Vec<Rule> {
        standard_rules().remove(&name).unwrap()
    }

    #[test]
    fn test_every_dataset_has_rules() {
        let rules = standard_rules();
        for name in DatasetName::ALL {
            assert!(rules.contains_key(&name), "no rules for {name}");
        }
    }

    #[test]
    fn test_order_date_strings_become_datetimes() {
        let orders = dataset(
            DatasetName::Orders,
            &["id", "created_at"],
            vec![vec![Value::Int(1), Value::from("2023-11-21")]],
        );
        let out = apply_rules(orders, &rules_for(DatasetName::Orders)).unwrap();

        assert_eq!(out.schema.column("created_at").unwrap().ty, ColumnType::DateTime);
        let Some(Value::DateTime(dt)) = out.value(0, "created_at") else {
            panic!("created_at is not a datetime");
        };
        assert_eq!((dt.year(), dt.month(), dt.day()), (2023, 11, 21));
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn test_products_drop_index_and_cast_price() {
        let products = dataset(
            DatasetName::Products,
            &["Unnamed: 0", "id", "name", "price"],
            vec![vec![
                Value::Int(0),
                Value::Int(1),
                Value::Int(404),
                Value::from("19.99"),
            ]],
        );
        let out = apply_rules(products, &rules_for(DatasetName::Products)).unwrap();

        assert_eq!(out.schema.names(), vec!["id", "name", "price"]);
        assert_eq!(out.value(0, "price"), Some(&Value::Float(19.99)));
        assert_eq!(out.value(0, "name"), Some(&Value::from("404")));
        assert_eq!(out.schema.column("price").unwrap().ty, ColumnType::Float);
    }

    #[test]
    fn test_drop_index_is_noop_without_placeholders() {
        let suppliers = dataset(DatasetName::Suppliers, &["id"], vec![vec![Value::Int(1)]]);
        let out = drop_index_columns(suppliers.clone()).unwrap();
        assert_eq!(out, suppliers);
    }

    #[test]
    fn test_uncastable_value_fails_dataset() {
        let products = dataset(
            DatasetName::Products,
            &["id", "name", "price"],
            vec![
                vec![Value::Int(1), Value::from("a"), Value::from("1.5")],
                vec![Value::Int(2), Value::from("b"), Value::from("cheap")],
            ],
        );
        let err = apply_rules(products, &rules_for(DatasetName::Products)).unwrap_err();
        match err {
            PipelineError::Coercion {
                dataset, column, row, ..
            } => {
                assert_eq!(dataset, DatasetName::Products);
                assert_eq!(column, "price");
                assert_eq!(row, 1);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rule_on_absent_column_is_missing_column() {
        let coupons = dataset(DatasetName::Coupons, &["id"], vec![vec![Value::Int(1)]]);
        let err = apply_rules(coupons, &rules_for(DatasetName::Coupons)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { ref column, .. } if column == "discount_percent"));
    }

    #[test]
    fn test_dedup_keeps_last_occurrence() {
        let customers = dataset(
            DatasetName::Customers,
            &["id", "name"],
            vec![
                vec![Value::Int(1), Value::from("A")],
                vec![Value::Int(1), Value::from("B")],
                vec![Value::Int(2), Value::from("C")],
            ],
        );
        let out = dedup_last(customers, &["id".to_string()]).unwrap();
        assert_eq!(
            out.rows,
            vec![
                vec![Value::Int(1), Value::from("B")],
                vec![Value::Int(2), Value::from("C")],
            ]
        );
    }

    #[test]
    fn test_coerce_value_table() {
        assert_eq!(coerce_value(&Value::Null, ColumnType::Float), Some(Value::Null));
        assert_eq!(coerce_value(&Value::Bool(true), ColumnType::Float), Some(Value::Float(1.0)));
        assert_eq!(coerce_value(&Value::Float(3.0), ColumnType::Integer), Some(Value::Int(3)));
        assert_eq!(coerce_value(&Value::Float(3.5), ColumnType::Integer), None);
        assert_eq!(coerce_value(&Value::from("1"), ColumnType::Boolean), Some(Value::Bool(true)));
        assert_eq!(coerce_value(&Value::from("yes"), ColumnType::Boolean), None);
        assert_eq!(
            coerce_value(&Value::Int(1_700_524_800_000_000_000), ColumnType::DateTime)
                .unwrap()
                .to_string(),
            "2023-11-21 00:00:00"
        );
        assert_eq!(
            coerce_value(&Value::from("2023-11-21T10:30:00+02:00"), ColumnType::DateTime)
                .unwrap()
                .to_string(),
            "2023-11-21 08:30:00"
        );
    }

    proptest! {
        #[test]
        fn prop_dedup_is_idempotent(rows in prop::collection::vec((0i64..8, any::<i32>()), 0..64)) {
            let rows = rows
                .into_iter()
                .map(|(id, v)| vec![Value::Int(id), Value::Int(i64::from(v))])
                .collect();
            let ds = dataset(DatasetName::Login, &["id", "value"], rows);
            let key = vec!["id".to_string()];

            let once = dedup_last(ds, &key).unwrap();
            let twice = dedup_last(once.clone(), &key).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
