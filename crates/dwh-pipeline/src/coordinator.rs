//! Run coordinator
//!
//! Owns the task graph and the task implementations, and executes one run at
//! a time: the graph is walked layer by layer, every task of a layer runs
//! concurrently, and the next layer starts only once the whole layer has
//! succeeded. A failed layer fails the run at that stage and every task in
//! later layers is reported as skipped.

use chrono::{DateTime, Utc};
use dwh_common::DatasetName;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceManifest;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::graph::{Stage, TaskGraph, TaskId};
use crate::ingest::IngestTask;
use crate::load::{LoadTask, TableReport, WarehouseSink};
use crate::retry::RetryPolicy;
use crate::source::DecoderRegistry;
use crate::store::IntermediateStore;
use crate::transform::TransformTask;

// ============================================================================
// Run Reports
// ============================================================================

/// Final state of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Final state of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { stage: Stage },
}

/// What happened to one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_in: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_out: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskReport {
    fn skipped(task: TaskId) -> Self {
        Self {
            task,
            status: TaskStatus::Skipped,
            attempts: 0,
            rows_in: None,
            rows_out: None,
            error_kind: None,
            error: None,
            duration_ms: 0,
        }
    }
}

/// Everything a caller needs to know about one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: Vec<TaskReport>,
    pub tables: Vec<TableReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn task(&self, task: TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task == task)
    }

    pub fn failed_tasks(&self) -> Vec<&TaskReport> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Task implementations shared with spawned task futures
struct TaskSet {
    ingest: HashMap<DatasetName, IngestTask>,
    transform: TransformTask,
    load: LoadTask,
    retry: RetryPolicy,
}

/// Result of executing one task, before it becomes a report
struct TaskOutcome {
    task: TaskId,
    attempts: u32,
    rows_in: Option<usize>,
    rows_out: Option<usize>,
    tables: Vec<TableReport>,
    result: Result<()>,
    duration_ms: u64,
}

impl TaskOutcome {
    fn into_report(self) -> (TaskReport, Vec<TableReport>) {
        let (status, error_kind, error) = match &self.result {
            Ok(()) => (TaskStatus::Succeeded, None, None),
            Err(e) => (TaskStatus::Failed, Some(e.kind()), Some(e.to_string())),
        };
        let report = TaskReport {
            task: self.task,
            status,
            attempts: self.attempts,
            rows_in: self.rows_in,
            rows_out: self.rows_out,
            error_kind,
            error,
            duration_ms: self.duration_ms,
        };
        (report, self.tables)
    }
}

/// Schedules the task graph for one run at a time
pub struct RunCoordinator {
    graph: TaskGraph,
    layers: Vec<Vec<TaskId>>,
    tasks: Arc<TaskSet>,
}

impl RunCoordinator {
    /// Build a coordinator for the standard graph
    ///
    /// Fails unless there is exactly one ingest task per dataset.
    pub fn new(
        ingest: Vec<IngestTask>,
        transform: TransformTask,
        load: LoadTask,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut by_name = HashMap::new();
        for task in ingest {
            let name = task.dataset();
            if by_name.insert(name, task).is_some() {
                return Err(PipelineError::Config(format!(
                    "More than one ingest task for {}",
                    name
                )));
            }
        }
        let missing: Vec<String> = DatasetName::ALL
            .into_iter()
            .filter(|name| !by_name.contains_key(name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "No ingest task for {}",
                missing.join(", ")
            )));
        }

        let graph = TaskGraph::standard();
        graph.validate()?;
        let layers = graph.layers()?;

        Ok(Self {
            graph,
            layers,
            tasks: Arc::new(TaskSet {
                ingest: by_name,
                transform,
                load,
                retry,
            }),
        })
    }

    /// Wire the standard tasks from a source manifest and a sink
    pub fn from_manifest(
        manifest: &SourceManifest,
        decoders: Arc<DecoderRegistry>,
        sink: Arc<dyn WarehouseSink>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let missing = manifest.missing();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|n| n.to_string()).collect();
            return Err(PipelineError::Config(format!(
                "No source files declared for {}",
                names.join(", ")
            )));
        }

        let ingest = manifest
            .iter()
            .map(|(name, files)| IngestTask::new(name, files.to_vec(), decoders.clone()))
            .collect();

        Self::new(
            ingest,
            TransformTask::default(),
            LoadTask::new(sink, retry),
            retry,
        )
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Barrier-separated execution layers
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// Execute one complete run
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", run_id = %run_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid) -> RunReport {
        let started_at = Utc::now();
        let store = Arc::new(IntermediateStore::new(run_id));
        info!(run_id = %run_id, layers = self.layers.len(), "Pipeline run started");

        let mut tasks = Vec::new();
        let mut tables = Vec::new();
        let mut failed_stage: Option<Stage> = None;

        for layer in &self.layers {
            if failed_stage.is_some() {
                for task in layer {
                    warn!(run_id = %run_id, task = %task, "Task skipped");
                    tasks.push(TaskReport::skipped(*task));
                }
                continue;
            }

            let mut outcomes = self.execute_layer(layer, &store).await;
            for task in layer {
                let Some(outcome) = outcomes.remove(task) else {
                    continue;
                };
                let (report, table_reports) = outcome.into_report();
                if report.status == TaskStatus::Failed && failed_stage.is_none() {
                    failed_stage = Some(task.stage());
                }
                tasks.push(report);
                tables.extend(table_reports);
            }
        }

        let discarded = store.teardown().await;
        let status = match failed_stage {
            None => RunStatus::Succeeded,
            Some(stage) => RunStatus::Failed { stage },
        };

        let finished_at = Utc::now();
        match status {
            RunStatus::Succeeded => info!(
                run_id = %run_id,
                tables = tables.len(),
                discarded,
                duration_ms = (finished_at - started_at).num_milliseconds(),
                "Pipeline run succeeded"
            ),
            RunStatus::Failed { stage } => error!(
                run_id = %run_id,
                stage = %stage,
                discarded,
                duration_ms = (finished_at - started_at).num_milliseconds(),
                "Pipeline run failed"
            ),
        }

        RunReport {
            run_id,
            started_at,
            finished_at,
            status,
            tasks,
            tables,
        }
    }

    /// Run every task of `layer` concurrently and wait for all of them
    async fn execute_layer(
        &self,
        layer: &[TaskId],
        store: &Arc<IntermediateStore>,
    ) -> HashMap<TaskId, TaskOutcome> {
        let mut set = JoinSet::new();
        for &task in layer {
            let tasks = self.tasks.clone();
            let store = store.clone();
            set.spawn(async move {
                let started = Instant::now();
                AssertUnwindSafe(tasks.execute(task, &store))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| TaskOutcome {
                        task,
                        attempts: 1,
                        rows_in: None,
                        rows_out: None,
                        tables: Vec::new(),
                        result: Err(PipelineError::Config(format!("Task {} panicked", task))),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
            });
        }

        let mut outcomes = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    outcomes.insert(outcome.task, outcome);
                },
                Err(e) => error!(error = %e, "Task future did not complete"),
            }
        }

        // A task whose future vanished still fails the layer
        for &task in layer {
            outcomes.entry(task).or_insert_with(|| TaskOutcome {
                task,
                attempts: 0,
                rows_in: None,
                rows_out: None,
                tables: Vec::new(),
                result: Err(PipelineError::Config(format!("Task {} did not complete", task))),
                duration_ms: 0,
            });
        }
        outcomes
    }
}

impl TaskSet {
    async fn execute(&self, task: TaskId, store: &IntermediateStore) -> TaskOutcome {
        let started = Instant::now();
        let label = task.to_string();

        let mut outcome = TaskOutcome {
            task,
            attempts: 1,
            rows_in: None,
            rows_out: None,
            tables: Vec::new(),
            result: Ok(()),
            duration_ms: 0,
        };

        match task {
            TaskId::Ingest(name) => match self.ingest.get(&name) {
                Some(ingest) => {
                    let retried = self.retry.run(&label, move || ingest.run(store)).await;
                    outcome.attempts = retried.attempts;
                    match retried.result {
                        Ok(rows) => outcome.rows_out = Some(rows),
                        Err(e) => outcome.result = Err(e),
                    }
                },
                None => {
                    outcome.result = Err(PipelineError::Config(format!(
                        "No ingest task for {}",
                        name
                    )))
                },
            },
            TaskId::Transform => {
                let transform = &self.transform;
                let retried = self.retry.run(&label, move || transform.run(store)).await;
                outcome.attempts = retried.attempts;
                match retried.result {
                    Ok(deltas) => {
                        outcome.rows_in = Some(deltas.iter().map(|d| d.rows_in).sum());
                        outcome.rows_out = Some(deltas.iter().map(|d| d.rows_out).sum());
                    },
                    Err(e) => outcome.result = Err(e),
                }
            },
            // Retries happen per table inside the load task
            TaskId::Load => match self.load.run(store).await {
                Ok(report) => {
                    let mut rows_in = 0;
                    for name in DatasetName::ALL {
                        if let Ok(dataset) = store.fetch(name).await {
                            rows_in += dataset.row_count();
                        }
                    }
                    outcome.rows_in = Some(rows_in);
                    outcome.rows_out = Some(report.rows_written() as usize);
                    outcome.attempts = report.tables.iter().map(|t| t.attempts).max().unwrap_or(1);
                    if let Some(e) = report.to_error() {
                        outcome.result = Err(e);
                    }
                    outcome.tables = report.tables;
                },
                Err(e) => outcome.result = Err(e),
            },
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }
}
