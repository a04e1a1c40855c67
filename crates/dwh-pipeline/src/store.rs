//! Run-scoped intermediate store
//!
//! Tasks never share memory directly; they hand datasets to each other by
//! publishing into and fetching from this store. One store exists per run,
//! is owned by the coordinator, and is discarded when the run ends.

use chrono::{DateTime, Utc};
use dwh_common::{Dataset, DatasetName};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::graph::TaskId;

/// One published dataset plus its provenance
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub dataset: Arc<Dataset>,
    pub producer: TaskId,
    pub written_at: DateTime<Utc>,
}

/// Keyed handoff between pipeline tasks
#[derive(Debug)]
pub struct IntermediateStore {
    run_id: Uuid,
    entries: RwLock<HashMap<DatasetName, StoreEntry>>,
}

impl IntermediateStore {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Publish `dataset` under its own name, replacing any previous value
    ///
    /// Fails if `task` does not own that key.
    pub async fn publish(&self, task: TaskId, dataset: Dataset) -> Result<()> {
        let name = dataset.name;
        if !task.may_publish(name) {
            return Err(PipelineError::OwnershipViolation {
                task,
                dataset: name,
            });
        }

        let rows = dataset.row_count();
        let entry = StoreEntry {
            dataset: Arc::new(dataset),
            producer: task,
            written_at: Utc::now(),
        };

        let previous = self.entries.write().await.insert(name, entry);
        debug!(
            run_id = %self.run_id,
            task = %task,
            dataset = %name,
            rows,
            replaced = previous.is_some(),
            "Dataset published"
        );
        Ok(())
    }

    /// Fetch the current value for `name`
    pub async fn fetch(&self, name: DatasetName) -> Result<Arc<Dataset>> {
        self.entries
            .read()
            .await
            .get(&name)
            .map(|entry| entry.dataset.clone())
            .ok_or(PipelineError::MissingDataset(name))
    }

    /// Fetch the full entry, including who wrote it and when
    pub async fn entry(&self, name: DatasetName) -> Option<StoreEntry> {
        self.entries.read().await.get(&name).cloned()
    }

    /// Names published so far, sorted
    pub async fn published(&self) -> Vec<DatasetName> {
        let mut names: Vec<DatasetName> = self.entries.read().await.keys().copied().collect();
        names.sort();
        names
    }

    /// Drop every entry; only the coordinator calls this, at run end
    pub(crate) async fn teardown(&self) -> usize {
        let mut entries = self.entries.write().await;
        let discarded = entries.len();
        entries.clear();
        debug!(run_id = %self.run_id, discarded, "Intermediate store discarded");
        discarded
    }
}
