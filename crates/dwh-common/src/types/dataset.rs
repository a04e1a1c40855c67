//! Tabular values exchanged between pipeline stages

use serde::Serialize;
use std::collections::HashMap;

use super::{Column, ColumnType, DatasetName, Schema, Value};

/// Untyped decoder output: column names plus positional rows
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row, padding or truncating it to the column count
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether both tables carry the same set of column names
    pub fn same_column_set(&self, columns: &[String]) -> bool {
        if self.columns.len() != columns.len() {
            return false;
        }
        let mut ours: Vec<&String> = self.columns.iter().collect();
        let mut theirs: Vec<&String> = columns.iter().collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }

    /// Reorder columns to `order`, which must hold the same column set
    pub fn reordered(self, order: &[String]) -> Option<Table> {
        if !self.same_column_set(order) {
            return None;
        }
        if self.columns == order {
            return Some(self);
        }

        let positions: HashMap<&str, usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mapping: Vec<usize> = order
            .iter()
            .filter_map(|name| positions.get(name.as_str()).copied())
            .collect();

        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Some(Table {
            columns: order.to_vec(),
            rows,
        })
    }
}

/// A named, typed dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub name: DatasetName,
    pub schema: Schema,
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(name: DatasetName, schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { name, schema, rows }
    }

    /// Build a dataset from decoder output, inferring each column's type from
    /// the values it holds
    pub fn from_table(name: DatasetName, table: Table) -> Self {
        let mut types = vec![ColumnType::Null; table.columns.len()];
        for row in &table.rows {
            for (ty, value) in types.iter_mut().zip(row) {
                *ty = ty.unify(value.column_type());
            }
        }

        let columns = table
            .columns
            .into_iter()
            .zip(types)
            .map(|(name, ty)| Column::new(name, ty))
            .collect();

        Self {
            name,
            schema: Schema::new(columns),
            rows: table.rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell lookup by row index and column name
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.index_of(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of one column, in row order
    pub fn column_values(&self, column: &str) -> Option<Vec<&Value>> {
        let idx = self.schema.index_of(column)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_schema_inference_unifies_numeric_types() {
        let mut table = Table::new(cols(&["id", "price", "note"]));
        table.push_row(vec![Value::Int(1), Value::Int(10), Value::Null]);
        table.push_row(vec![Value::Int(2), Value::Float(9.5), Value::from("x")]);

        let dataset = Dataset::from_table(DatasetName::Products, table);
        let types: Vec<ColumnType> = dataset.schema.columns.iter().map(|c| c.ty).collect();
        assert_eq!(
            types,
            vec![ColumnType::Integer, ColumnType::Float, ColumnType::String]
        );
    }

    #[test]
    fn test_all_null_column_stays_null_typed() {
        let mut table = Table::new(cols(&["maybe"]));
        table.push_row(vec![Value::Null]);
        let dataset = Dataset::from_table(DatasetName::Coupons, table);
        assert_eq!(dataset.schema.columns[0].ty, ColumnType::Null);
    }

    #[test]
    fn test_reordered_aligns_columns() {
        let mut table = Table::new(cols(&["name", "id"]));
        table.push_row(vec![Value::from("A"), Value::Int(1)]);

        let aligned = table.reordered(&cols(&["id", "name"])).unwrap();
        assert_eq!(aligned.columns, cols(&["id", "name"]));
        assert_eq!(aligned.rows[0], vec![Value::Int(1), Value::from("A")]);
    }

    #[test]
    fn test_reordered_rejects_different_column_sets() {
        let table = Table::new(cols(&["id", "name"]));
        assert!(table.clone().reordered(&cols(&["id", "email"])).is_none());
        assert!(table.reordered(&cols(&["id"])).is_none());
    }

    #[test]
    fn test_push_row_pads_short_rows() {
        let mut table = Table::new(cols(&["a", "b"]));
        table.push_row(vec![Value::Int(1)]);
        assert_eq!(table.rows[0], vec![Value::Int(1), Value::Null]);
    }
}
