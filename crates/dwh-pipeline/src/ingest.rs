//! Ingestion task: decode a dataset's source files and publish them raw

use dwh_common::{Dataset, DatasetName, SourceFile, Table};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result, SourceReadKind};
use crate::graph::TaskId;
use crate::source::DecoderRegistry;
use crate::store::IntermediateStore;

/// Reads every source part of one dataset and publishes the concatenation
#[derive(Debug, Clone)]
pub struct IngestTask {
    dataset: DatasetName,
    sources: Vec<SourceFile>,
    decoders: Arc<DecoderRegistry>,
}

impl IngestTask {
    pub fn new(dataset: DatasetName, sources: Vec<SourceFile>, decoders: Arc<DecoderRegistry>) -> Self {
        Self {
            dataset,
            sources,
            decoders,
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId::Ingest(self.dataset)
    }

    pub fn dataset(&self) -> DatasetName {
        self.dataset
    }

    pub fn sources(&self) -> &[SourceFile] {
        &self.sources
    }

    /// Decode, concatenate and publish; returns the published row count
    pub async fn run(&self, store: &IntermediateStore) -> Result<usize> {
        info!(
            run_id = %store.run_id(),
            task = %self.id(),
            dataset = %self.dataset,
            files = self.sources.len(),
            "Ingestion started"
        );

        match self.ingest(store).await {
            Ok(rows) => {
                info!(
                    run_id = %store.run_id(),
                    task = %self.id(),
                    dataset = %self.dataset,
                    rows_out = rows,
                    "Ingestion succeeded"
                );
                Ok(rows)
            },
            Err(e) => {
                error!(
                    run_id = %store.run_id(),
                    task = %self.id(),
                    dataset = %self.dataset,
                    error = %e,
                    "Ingestion failed"
                );
                Err(e)
            },
        }
    }

    async fn ingest(&self, store: &IntermediateStore) -> Result<usize> {
        let mut combined: Option<Table> = None;

        for source in &self.sources {
            let part = self.decode_part(source).await?;
            combined = Some(match combined {
                None => part,
                Some(mut acc) => {
                    let found = part.columns.clone();
                    let part = part.reordered(&acc.columns).ok_or_else(|| {
                        PipelineError::SchemaMismatch {
                            dataset: self.dataset,
                            path: source.path.clone(),
                            expected: acc.columns.clone(),
                            found,
                        }
                    })?;
                    acc.rows.extend(part.rows);
                    acc
                },
            });
        }

        let dataset = Dataset::from_table(self.dataset, combined.unwrap_or_default());
        let rows = dataset.row_count();
        store.publish(self.id(), dataset).await?;
        Ok(rows)
    }

    async fn decode_part(&self, source: &SourceFile) -> Result<Table> {
        let decoders = self.decoders.clone();
        let dataset = self.dataset;
        let owned = source.clone();

        let table = tokio::task::spawn_blocking(move || decoders.decode(dataset, &owned))
            .await
            .map_err(|e| PipelineError::SourceRead {
                dataset,
                path: source.path.clone(),
                kind: SourceReadKind::Io,
                reason: format!("decoder task aborted: {}", e),
            })??;

        debug!(
            dataset = %dataset,
            path = %source.path.display(),
            rows = table.len(),
            "Source part decoded"
        );
        Ok(table)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dwh_common::{SourceFormat, Value};
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn write(dir: &Path, name: &str, body: &str) -> SourceFile {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        SourceFile::new(path, SourceFormat::Csv)
    }

    fn task(sources: Vec<SourceFile>) -> IngestTask {
        IngestTask::new(
            DatasetName::Customers,
            sources,
            Arc::new(DecoderRegistry::with_builtin()),
        )
    }

    #[tokio::test]
    async fn test_parts_concatenate_in_list_order_with_duplicates() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            write(dir.path(), "a.csv", "id,name\n1,A\n"),
            write(dir.path(), "b.csv", "id,name\n1,B\n2,C\n"),
            write(dir.path(), "c.csv", "id,name\n3,D\n"),
        ];
        let store = IntermediateStore::new(Uuid::new_v4());

        let rows = task(sources).run(&store).await.unwrap();
        assert_eq!(rows, 4);

        let dataset = store.fetch(DatasetName::Customers).await.unwrap();
        let names: Vec<&Value> = dataset.column_values("name").unwrap();
        assert_eq!(
            names,
            vec![&Value::from("A"), &Value::from("B"), &Value::from("C"), &Value::from("D")]
        );
    }

    #[tokio::test]
    async fn test_reordered_columns_are_aligned_to_first_part() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            write(dir.path(), "a.csv", "id,name\n1,A\n"),
            write(dir.path(), "b.csv", "name,id\nB,2\n"),
        ];
        let store = IntermediateStore::new(Uuid::new_v4());
        task(sources).run(&store).await.unwrap();

        let dataset = store.fetch(DatasetName::Customers).await.unwrap();
        assert_eq!(dataset.schema.names(), vec!["id", "name"]);
        assert_eq!(dataset.value(1, "id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_mismatched_columns_fail_without_publishing() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            write(dir.path(), "a.csv", "id,name\n1,A\n"),
            write(dir.path(), "b.csv", "id,email\n2,x@y\n"),
        ];
        let store = IntermediateStore::new(Uuid::new_v4());

        let err = task(sources).run(&store).await.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
        assert!(!err.is_retryable());
        assert!(store.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_part_is_source_read_error() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            write(dir.path(), "a.csv", "id,name\n1,A\n"),
            SourceFile::new(dir.path().join("missing.csv"), SourceFormat::Csv),
        ];
        let store = IntermediateStore::new(Uuid::new_v4());

        let err = task(sources).run(&store).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceRead { .. }));
        assert!(store.published().await.is_empty());
    }
}
