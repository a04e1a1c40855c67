//! Transform task: the fan-in barrier that normalizes every raw dataset
//!
//! The task fetches all raw datasets, runs each through its rule list and
//! only republishes once every dataset normalized cleanly, so the store
//! never holds a mix of raw and normalized values after a failure.

use dwh_common::{Dataset, DatasetName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::Result;
use crate::graph::TaskId;
use crate::store::IntermediateStore;

mod rules;

pub use rules::{
    apply_rules, coerce_column, coerce_value, dedup_last, drop_index_columns, standard_rules,
    Rule,
};

/// Row counts of one dataset across normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDelta {
    pub dataset: DatasetName,
    pub rows_in: usize,
    pub rows_out: usize,
}

/// Rule-table driven normalization of every dataset
#[derive(Debug, Clone)]
pub struct TransformTask {
    rules: HashMap<DatasetName, Vec<Rule>>,
}

impl Default for TransformTask {
    fn default() -> Self {
        Self::new(standard_rules())
    }
}

impl TransformTask {
    pub fn new(rules: HashMap<DatasetName, Vec<Rule>>) -> Self {
        Self { rules }
    }

    /// Replace the rule list of one dataset
    pub fn with_rules(mut self, dataset: DatasetName, rules: Vec<Rule>) -> Self {
        self.rules.insert(dataset, rules);
        self
    }

    pub fn rules_for(&self, dataset: DatasetName) -> &[Rule] {
        self.rules.get(&dataset).map(Vec::as_slice).unwrap_or(&[])
    }

    pub async fn run(&self, store: &IntermediateStore) -> Result<Vec<DatasetDelta>> {
        info!(run_id = %store.run_id(), task = %TaskId::Transform, "Transform started");

        match self.transform(store).await {
            Ok(deltas) => {
                info!(
                    run_id = %store.run_id(),
                    task = %TaskId::Transform,
                    rows_in = deltas.iter().map(|d| d.rows_in).sum::<usize>(),
                    rows_out = deltas.iter().map(|d| d.rows_out).sum::<usize>(),
                    "Transform succeeded"
                );
                Ok(deltas)
            },
            Err(e) => {
                error!(
                    run_id = %store.run_id(),
                    task = %TaskId::Transform,
                    error = %e,
                    "Transform failed"
                );
                Err(e)
            },
        }
    }

    async fn transform(&self, store: &IntermediateStore) -> Result<Vec<DatasetDelta>> {
        // Every input must be present before any work starts
        let mut raw = Vec::with_capacity(DatasetName::ALL.len());
        for name in DatasetName::ALL {
            raw.push(store.fetch(name).await?);
        }

        let mut normalized: Vec<Dataset> = Vec::with_capacity(raw.len());
        let mut deltas = Vec::with_capacity(raw.len());
        for dataset in raw {
            let name = dataset.name;
            let rows_in = dataset.row_count();
            let out = apply_rules(Arc::unwrap_or_clone(dataset), self.rules_for(name))?;
            info!(
                run_id = %store.run_id(),
                task = %TaskId::Transform,
                dataset = %name,
                rows_in,
                rows_out = out.row_count(),
                "Dataset normalized"
            );
            deltas.push(DatasetDelta {
                dataset: name,
                rows_in,
                rows_out: out.row_count(),
            });
            normalized.push(out);
        }

        for dataset in normalized {
            store.publish(TaskId::Transform, dataset).await?;
        }
        Ok(deltas)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use dwh_common::{Table, Value};
    use uuid::Uuid;

    fn ids(name: DatasetName, ids: &[i64]) -> Dataset {
        let mut table = Table::new(vec!["id".to_string()]);
        for id in ids {
            table.push_row(vec![Value::Int(*id)]);
        }
        Dataset::from_table(name, table)
    }

    fn dedup_only() -> TransformTask {
        let mut task = TransformTask::default();
        for name in DatasetName::ALL {
            task = task.with_rules(name, vec![Rule::dedup_on("id")]);
        }
        task
    }

    #[tokio::test]
    async fn test_fan_in_requires_every_dataset() {
        let store = IntermediateStore::new(Uuid::new_v4());
        for name in DatasetName::ALL.into_iter().filter(|n| *n != DatasetName::Suppliers) {
            store.publish(TaskId::Ingest(name), ids(name, &[1])).await.unwrap();
        }

        let err = dedup_only().run(&store).await.unwrap_err();
        assert!(matches!(err, PipelineError::MissingDataset(DatasetName::Suppliers)));
        let entry = store.entry(DatasetName::Orders).await.unwrap();
        assert_eq!(entry.producer, TaskId::Ingest(DatasetName::Orders));
    }

    #[tokio::test]
    async fn test_normalized_datasets_replace_raw_ones() {
        let store = IntermediateStore::new(Uuid::new_v4());
        for name in DatasetName::ALL {
            store.publish(TaskId::Ingest(name), ids(name, &[1, 1, 2])).await.unwrap();
        }

        let deltas = dedup_only().run(&store).await.unwrap();
        assert_eq!(deltas.len(), 8);
        assert!(deltas.iter().all(|d| d.rows_in == 3 && d.rows_out == 2));

        for name in DatasetName::ALL {
            let entry = store.entry(name).await.unwrap();
            assert_eq!(entry.producer, TaskId::Transform);
            assert_eq!(entry.dataset.row_count(), 2);
        }
    }

    #[tokio::test]
    async fn test_failure_leaves_raw_datasets_untouched() {
        let store = IntermediateStore::new(Uuid::new_v4());
        for name in DatasetName::ALL {
            store.publish(TaskId::Ingest(name), ids(name, &[1, 1])).await.unwrap();
        }
        let task = dedup_only().with_rules(DatasetName::Suppliers, vec![Rule::dedup_on("code")]);

        assert!(task.run(&store).await.is_err());
        for name in DatasetName::ALL {
            let entry = store.entry(name).await.unwrap();
            assert_eq!(entry.producer, TaskId::Ingest(name));
            assert_eq!(entry.dataset.row_count(), 2);
        }
    }
}
