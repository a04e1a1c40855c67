//! Error types shared across the warehouse pipeline crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, DwhError>;

/// Errors raised while parsing or validating shared domain values
#[derive(Error, Debug)]
pub enum DwhError {
    #[error("Unknown dataset name: {0}")]
    UnknownDataset(String),

    #[error("Unknown source format: {0}")]
    UnknownFormat(String),

    #[error("Unknown column type: {0}")]
    UnknownColumnType(String),
}
