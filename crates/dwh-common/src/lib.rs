//! DWH Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared domain types, error handling and logging for the warehouse
//! pipeline workspace.
//!
//! - **Types**: dataset names, typed scalar values, schemas, tables and datasets
//! - **Errors**: parse and validation errors for the shared types
//! - **Logging**: one-call tracing subscriber setup
//!
//! # Example
//!
//! ```
//! use dwh_common::types::{Dataset, DatasetName, Table, Value};
//!
//! let mut table = Table::new(vec!["id".into(), "name".into()]);
//! table.push_row(vec![Value::Int(1), Value::from("Ada")]);
//!
//! let dataset = Dataset::from_table(DatasetName::Customers, table);
//! assert_eq!(dataset.row_count(), 1);
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{DwhError, Result};
pub use types::{
    Column, ColumnType, Dataset, DatasetName, Schema, SourceFile, SourceFormat, Table, Value,
};
