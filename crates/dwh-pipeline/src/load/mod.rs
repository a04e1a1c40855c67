//! Load task: replace every destination table with its normalized dataset
//!
//! Tables are written one at a time through a [`WarehouseSink`]. Each table
//! replacement is retried on its own; a table that still fails is reported
//! and the remaining tables are written anyway. Nothing is rolled back.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use dwh_common::{Dataset, DatasetName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::graph::TaskId;
use crate::retry::RetryPolicy;
use crate::store::IntermediateStore;

mod memory;
mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresSink;

/// Destination store offering create-or-replace table writes
#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Replace `table` with the schema and rows of `dataset`
    ///
    /// Readers of `table` must observe either its old or its new contents.
    /// Returns the number of rows written.
    async fn replace_table(&self, table: &str, dataset: &Dataset) -> AnyResult<u64>;
}

/// Outcome of one table replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Replaced,
    Failed,
}

/// Per-table load result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub dataset: DatasetName,
    pub status: TableStatus,
    pub rows: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results for every table, in write order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub tables: Vec<TableReport>,
}

impl LoadReport {
    pub fn failed(&self) -> Vec<&TableReport> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    /// Collapse table failures into one error naming every failed table
    pub fn to_error(&self) -> Option<PipelineError> {
        let failed = self.failed();
        if failed.is_empty() {
            return None;
        }
        let tables: Vec<&str> = failed.iter().map(|t| t.table.as_str()).collect();
        let reason = failed
            .iter()
            .find_map(|t| t.error.as_deref())
            .unwrap_or("unknown failure");
        Some(PipelineError::load(tables.join(", "), reason))
    }
}

/// Serial writer of all normalized datasets
#[derive(Clone)]
pub struct LoadTask {
    sink: Arc<dyn WarehouseSink>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTask")
            .field("sink", &self.sink.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl LoadTask {
    pub fn new(sink: Arc<dyn WarehouseSink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Write every dataset; fails up front only if an input is missing
    pub async fn run(&self, store: &IntermediateStore) -> Result<LoadReport> {
        info!(
            run_id = %store.run_id(),
            task = %TaskId::Load,
            sink = self.sink.name(),
            "Load started"
        );

        let mut datasets = Vec::with_capacity(DatasetName::ALL.len());
        for name in DatasetName::ALL {
            datasets.push(store.fetch(name).await?);
        }

        let mut report = LoadReport::default();
        for dataset in datasets {
            report.tables.push(self.load_table(store, &dataset).await);
        }

        if report.is_success() {
            info!(
                run_id = %store.run_id(),
                task = %TaskId::Load,
                tables = report.tables.len(),
                rows_out = report.rows_written(),
                "Load succeeded"
            );
        } else {
            error!(
                run_id = %store.run_id(),
                task = %TaskId::Load,
                failed = report.failed().len(),
                tables = report.tables.len(),
                "Load finished with failed tables"
            );
        }
        Ok(report)
    }

    async fn load_table(&self, store: &IntermediateStore, dataset: &Dataset) -> TableReport {
        let table = dataset.name.table_name();
        let sink = self.sink.as_ref();

        let outcome = self
            .retry
            .run(table, move || async move {
                sink.replace_table(table, dataset)
                    .await
                    .map_err(|e| PipelineError::load(table, format!("{:#}", e)))
            })
            .await;

        match outcome.result {
            Ok(rows) => {
                info!(
                    run_id = %store.run_id(),
                    table,
                    dataset = %dataset.name,
                    rows_in = dataset.row_count(),
                    rows_out = rows,
                    attempts = outcome.attempts,
                    "Table replaced"
                );
                TableReport {
                    table: table.to_string(),
                    dataset: dataset.name,
                    status: TableStatus::Replaced,
                    rows,
                    attempts: outcome.attempts,
                    error: None,
                }
            },
            Err(e) => {
                error!(
                    run_id = %store.run_id(),
                    table,
                    dataset = %dataset.name,
                    attempts = outcome.attempts,
                    error = %e,
                    "Table replacement failed"
                );
                TableReport {
                    table: table.to_string(),
                    dataset: dataset.name,
                    status: TableStatus::Failed,
                    rows: 0,
                    attempts: outcome.attempts,
                    error: Some(e.to_string()),
                }
            },
        }
    }
}
