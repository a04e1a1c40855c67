//! Static task graph for one pipeline run
//!
//! The graph is explicit data, not convention: nodes are [`TaskId`]s and
//! edges are "must complete before" dependencies. The coordinator executes
//! the graph layer by layer, where a layer holds every task whose
//! predecessors all live in earlier layers.

use dwh_common::DatasetName;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PipelineError, Result};

/// Pipeline stage a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Transform,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingest => f.write_str("ingest"),
            Stage::Transform => f.write_str("transform"),
            Stage::Load => f.write_str("load"),
        }
    }
}

/// Identity of a task within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "task", content = "dataset", rename_all = "snake_case")]
pub enum TaskId {
    Ingest(DatasetName),
    Transform,
    Load,
}

impl TaskId {
    pub fn stage(&self) -> Stage {
        match self {
            TaskId::Ingest(_) => Stage::Ingest,
            TaskId::Transform => Stage::Transform,
            TaskId::Load => Stage::Load,
        }
    }

    /// Dataset this task is dedicated to, if any
    pub fn dataset(&self) -> Option<DatasetName> {
        match self {
            TaskId::Ingest(name) => Some(*name),
            _ => None,
        }
    }

    /// Whether this task owns the store key for `dataset`
    pub fn may_publish(&self, dataset: DatasetName) -> bool {
        match self {
            TaskId::Ingest(own) => *own == dataset,
            TaskId::Transform => true,
            TaskId::Load => false,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Ingest(name) => write!(f, "ingest[{}]", name),
            TaskId::Transform => f.write_str("transform"),
            TaskId::Load => f.write_str("load"),
        }
    }
}

/// Directed acyclic graph of tasks
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan-out ingestion of every dataset, a fan-in transform, then load
    pub fn standard() -> Self {
        let mut graph = Self::new();
        for name in DatasetName::ALL {
            graph.add_dependency(TaskId::Ingest(name), TaskId::Transform);
        }
        graph.add_dependency(TaskId::Transform, TaskId::Load);
        graph
    }

    /// Add a node; adding an existing task is a no-op
    pub fn add_task(&mut self, task: TaskId) -> NodeIndex {
        if let Some(idx) = self.index.get(&task) {
            return *idx;
        }
        let idx = self.graph.add_node(task);
        self.index.insert(task, idx);
        idx
    }

    /// Declare that `before` must complete before `after` starts
    pub fn add_dependency(&mut self, before: TaskId, after: TaskId) {
        let from = self.add_task(before);
        let to = self.add_task(after);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn tasks(&self) -> Vec<TaskId> {
        self.graph.node_weights().copied().collect()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.index.contains_key(&task)
    }

    /// Direct predecessors of `task`, sorted
    pub fn predecessors(&self, task: TaskId) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(&task) else {
            return Vec::new();
        };
        let mut preds: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n])
            .collect();
        preds.sort();
        preds
    }

    /// Group tasks into barrier-separated execution layers
    pub fn layers(&self) -> Result<Vec<Vec<TaskId>>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            PipelineError::Config(format!(
                "Task graph has a cycle through {}",
                self.graph[cycle.node_id()]
            ))
        })?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for &node in &order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|pred| depth.get(&pred))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }

        let max_depth = depth.values().copied().max().map_or(0, |d| d + 1);
        let mut layers: Vec<Vec<TaskId>> = vec![Vec::new(); max_depth];
        for (node, d) in depth {
            layers[d].push(self.graph[node]);
        }
        for layer in &mut layers {
            layer.sort();
        }
        Ok(layers)
    }

    /// Check the run contract: acyclic, transform waits on every ingest
    /// task, load waits on transform
    pub fn validate(&self) -> Result<()> {
        self.layers()?;

        let transform_preds = self.predecessors(TaskId::Transform);
        let missing: Vec<String> = DatasetName::ALL
            .into_iter()
            .filter(|name| !transform_preds.contains(&TaskId::Ingest(*name)))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "Transform does not wait for ingestion of {}",
                missing.join(", ")
            )));
        }

        if !self.predecessors(TaskId::Load).contains(&TaskId::Transform) {
            return Err(PipelineError::Config(
                "Load does not wait for transform".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_graph_has_three_layers() {
        let layers = TaskGraph::standard().layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].len(), 8);
        assert!(layers[0].iter().all(|t| t.stage() == Stage::Ingest));
        assert_eq!(layers[1], vec![TaskId::Transform]);
        assert_eq!(layers[2], vec![TaskId::Load]);
    }

    #[test]
    fn test_standard_graph_validates() {
        TaskGraph::standard().validate().unwrap();
    }

    #[test]
    fn test_transform_missing_an_ingest_edge_is_rejected() {
        let mut graph = TaskGraph::new();
        for name in DatasetName::ALL.into_iter().filter(|n| *n != DatasetName::Suppliers) {
            graph.add_dependency(TaskId::Ingest(name), TaskId::Transform);
        }
        graph.add_dependency(TaskId::Transform, TaskId::Load);

        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("SUPPLIERS"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = TaskGraph::standard();
        graph.add_dependency(TaskId::Load, TaskId::Transform);
        assert!(graph.layers().is_err());
    }

    #[test]
    fn test_publish_ownership() {
        assert!(TaskId::Ingest(DatasetName::Orders).may_publish(DatasetName::Orders));
        assert!(!TaskId::Ingest(DatasetName::Orders).may_publish(DatasetName::Coupons));
        assert!(TaskId::Transform.may_publish(DatasetName::Coupons));
        assert!(!TaskId::Load.may_publish(DatasetName::Coupons));
    }
}
