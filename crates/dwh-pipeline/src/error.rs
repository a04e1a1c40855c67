//! Pipeline error taxonomy
//!
//! Every task failure maps to exactly one [`PipelineError`] variant. Only I/O
//! hiccups while reading sources and destination write failures are worth
//! retrying; everything else is deterministic and fails fast.

use dwh_common::{ColumnType, DatasetName};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::graph::TaskId;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a source file could not be turned into rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceReadKind {
    /// The file does not exist
    NotFound,
    /// Transient I/O failure while reading
    Io,
    /// The bytes are not valid for the declared format
    Decode,
}

impl std::fmt::Display for SourceReadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceReadKind::NotFound => f.write_str("not found"),
            SourceReadKind::Io => f.write_str("i/o failure"),
            SourceReadKind::Decode => f.write_str("decode failure"),
        }
    }
}

/// Errors raised by pipeline tasks and the run coordinator
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source read error for {dataset} ({kind}) at {}: {reason}", path.display())]
    SourceRead {
        dataset: DatasetName,
        path: PathBuf,
        kind: SourceReadKind,
        reason: String,
    },

    #[error(
        "Schema mismatch for {dataset} at {}: expected columns {expected:?}, found {found:?}",
        path.display()
    )]
    SchemaMismatch {
        dataset: DatasetName,
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Coercion error for {dataset}.{column} at row {row}: cannot cast '{value}' to {target}")]
    Coercion {
        dataset: DatasetName,
        column: String,
        row: usize,
        value: String,
        target: ColumnType,
    },

    #[error("Column {column} not found in {dataset}")]
    MissingColumn { dataset: DatasetName, column: String },

    #[error("Dataset {0} was never published in this run")]
    MissingDataset(DatasetName),

    #[error("Task {task} may not publish {dataset}")]
    OwnershipViolation { task: TaskId, dataset: DatasetName },

    #[error("Load error for table {table}: {reason}")]
    Load { table: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Serializable classification of a [`PipelineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceRead,
    SchemaMismatch,
    Coercion,
    MissingColumn,
    MissingDataset,
    OwnershipViolation,
    Load,
    Config,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceRead { .. } => ErrorKind::SourceRead,
            PipelineError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            PipelineError::Coercion { .. } => ErrorKind::Coercion,
            PipelineError::MissingColumn { .. } => ErrorKind::MissingColumn,
            PipelineError::MissingDataset(_) => ErrorKind::MissingDataset,
            PipelineError::OwnershipViolation { .. } => ErrorKind::OwnershipViolation,
            PipelineError::Load { .. } => ErrorKind::Load,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::SourceRead { kind, .. } => *kind == SourceReadKind::Io,
            PipelineError::Load { .. } => true,
            _ => false,
        }
    }

    pub fn load(table: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Load {
            table: table.into(),
            reason: err.to_string(),
        }
    }
}

impl From<dwh_common::DwhError> for PipelineError {
    fn from(err: dwh_common::DwhError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
