//! Common types used across the warehouse pipeline

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::DwhError;

mod dataset;

pub use dataset::{Dataset, Table};

// ============================================================================
// Dataset Names
// ============================================================================

/// The fixed set of datasets the pipeline materializes.
///
/// Every stage addresses intermediate data through this enum, so a key that
/// was never declared cannot be published or fetched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DatasetName {
    Coupons,
    Customers,
    Login,
    OrderItems,
    Orders,
    ProductCategories,
    Products,
    Suppliers,
}

impl DatasetName {
    /// All datasets, in load order
    pub const ALL: [DatasetName; 8] = [
        DatasetName::Coupons,
        DatasetName::Customers,
        DatasetName::Login,
        DatasetName::OrderItems,
        DatasetName::Orders,
        DatasetName::ProductCategories,
        DatasetName::Products,
        DatasetName::Suppliers,
    ];

    /// Lower snake form used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetName::Coupons => "coupons",
            DatasetName::Customers => "customers",
            DatasetName::Login => "login",
            DatasetName::OrderItems => "order_items",
            DatasetName::Orders => "orders",
            DatasetName::ProductCategories => "product_categories",
            DatasetName::Products => "products",
            DatasetName::Suppliers => "suppliers",
        }
    }

    /// Destination table in the warehouse
    pub fn table_name(&self) -> &'static str {
        match self {
            DatasetName::Login => "login_attempts",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for DatasetName {
    type Err = DwhError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        DatasetName::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| DwhError::UnknownDataset(s.to_string()))
    }
}

// ============================================================================
// Source File References
// ============================================================================

/// On-disk encoding of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// One JSON object per line
    JsonLines,
    /// Comma-delimited text with a header row
    Csv,
    /// A JSON document holding records
    Json,
    /// Apache Parquet
    Parquet,
    /// Apache Avro object container
    Avro,
    /// First worksheet of an xls/xlsx workbook
    Spreadsheet,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::JsonLines => "json_lines",
            SourceFormat::Csv => "csv",
            SourceFormat::Json => "json",
            SourceFormat::Parquet => "parquet",
            SourceFormat::Avro => "avro",
            SourceFormat::Spreadsheet => "spreadsheet",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = DwhError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json_lines" | "jsonl" | "ndjson" => Ok(SourceFormat::JsonLines),
            "csv" => Ok(SourceFormat::Csv),
            "json" => Ok(SourceFormat::Json),
            "parquet" => Ok(SourceFormat::Parquet),
            "avro" => Ok(SourceFormat::Avro),
            "spreadsheet" | "excel" | "xls" | "xlsx" => Ok(SourceFormat::Spreadsheet),
            _ => Err(DwhError::UnknownFormat(s.to_string())),
        }
    }
}

/// A single file feeding one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub format: SourceFormat,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>, format: SourceFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

// ============================================================================
// Scalars and Schemas
// ============================================================================

/// Declared type of a dataset column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
    /// No non-null value has been observed
    Null,
}

impl ColumnType {
    /// Combine two observed types into one that can hold both
    pub fn unify(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "datetime",
            ColumnType::Null => "null",
        };
        f.write_str(name)
    }
}

impl FromStr for ColumnType {
    type Err = DwhError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(ColumnType::String),
            "integer" | "int" => Ok(ColumnType::Integer),
            "float" | "double" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "datetime" | "timestamp" => Ok(ColumnType::DateTime),
            _ => Err(DwhError::UnknownColumnType(s.to_string())),
        }
    }
}

/// A typed cell value
/// Serializes untagged, so a datetime encodes as an ISO-8601 string
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
}

impl Value {
    /// Type of this value, `ColumnType::Null` for nulls
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::String(_) => ColumnType::String,
            Value::DateTime(_) => ColumnType::DateTime,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

// Floats compare by bit pattern so values can key a hash map during dedup.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {},
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::DateTime(dt) => dt.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{:.1}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered list of columns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Position of a column by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
