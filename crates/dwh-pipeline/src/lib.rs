//! DWH Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch pipeline that ingests source files, normalizes them into the fixed
//! set of warehouse datasets and replaces the matching warehouse tables.
//!
//! # Stages
//!
//! - **Ingest**: one task per dataset decodes and concatenates its source files
//! - **Transform**: a fan-in barrier applying the per-dataset rule table
//! - **Load**: create-or-replace of every destination table
//!
//! Tasks hand data to each other only through the run-scoped
//! [`store::IntermediateStore`]; the [`coordinator::RunCoordinator`] walks the
//! explicit [`graph::TaskGraph`] and reports the outcome of every task.
//!
//! # Example
//!
//! ```no_run
//! use dwh_pipeline::config::SourceManifest;
//! use dwh_pipeline::coordinator::RunCoordinator;
//! use dwh_pipeline::load::MemoryWarehouse;
//! use dwh_pipeline::retry::RetryPolicy;
//! use dwh_pipeline::source::DecoderRegistry;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinator = RunCoordinator::from_manifest(
//!         &SourceManifest::standard(Path::new("data")),
//!         Arc::new(DecoderRegistry::with_builtin()),
//!         Arc::new(MemoryWarehouse::new()),
//!         RetryPolicy::default(),
//!     )?;
//!     let report = coordinator.run().await;
//!     println!("{:?}", report.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod load;
pub mod retry;
pub mod source;
pub mod store;
pub mod transform;

pub use coordinator::{RunCoordinator, RunReport, RunStatus, TaskReport, TaskStatus};
pub use error::{ErrorKind, PipelineError, Result};
pub use graph::{Stage, TaskGraph, TaskId};
