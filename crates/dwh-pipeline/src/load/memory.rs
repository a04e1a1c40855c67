//! In-process warehouse used for dry runs and tests

use anyhow::Result;
use async_trait::async_trait;
use dwh_common::Dataset;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::WarehouseSink;

/// Tables held in memory; a replacement swaps the whole table at once
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, Dataset>>,
    writes: AtomicUsize,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a table without counting it as a pipeline write
    pub async fn seed(&self, table: impl Into<String>, dataset: Dataset) {
        self.tables.write().await.insert(table.into(), dataset);
    }

    pub async fn table(&self, name: &str) -> Option<Dataset> {
        self.tables.read().await.get(name).cloned()
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of successful `replace_table` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WarehouseSink for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn replace_table(&self, table: &str, dataset: &Dataset) -> Result<u64> {
        let rows = dataset.row_count() as u64;
        self.tables
            .write()
            .await
            .insert(table.to_string(), dataset.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(table, rows, "Table replaced in memory");
        Ok(rows)
    }
}
