//! DWH Pipeline - batch warehouse loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dwh_common::logging::{init_logging, LogConfig, LogLevel};
use dwh_pipeline::config::{PipelineConfig, SourceManifest};
use dwh_pipeline::coordinator::{RunCoordinator, RunReport, RunStatus, TaskStatus};
use dwh_pipeline::load::{MemoryWarehouse, PostgresSink, WarehouseSink};
use dwh_pipeline::source::DecoderRegistry;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dwh-pipeline")]
#[command(author, version, about = "Batch loader for the warehouse datasets")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one pipeline run
    Run {
        /// Load into an in-memory warehouse instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,

        /// Directory holding the source files
        #[arg(long, env = "DWH_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// TOML file overriding source files per dataset
        #[arg(long, env = "DWH_SOURCES_FILE")]
        sources: Option<PathBuf>,

        /// Write the JSON run report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print execution layers and source files without running
    Plan {
        /// Directory holding the source files
        #[arg(long, env = "DWH_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// TOML file overriding source files per dataset
        #[arg(long, env = "DWH_SOURCES_FILE")]
        sources: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("dwh-pipeline")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            dry_run,
            data_dir,
            sources,
            report,
        } => {
            apply_overrides(&mut config, data_dir, sources);
            let manifest = config.manifest()?;

            let sink: Arc<dyn WarehouseSink> = if dry_run {
                info!("Dry run: loading into memory");
                Arc::new(MemoryWarehouse::new())
            } else {
                let pool = PgPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
                    .connect(&config.database.url)
                    .await
                    .context("Failed to connect to database")?;
                Arc::new(PostgresSink::new(pool, config.target_schema.clone()))
            };

            let coordinator = RunCoordinator::from_manifest(
                &manifest,
                Arc::new(DecoderRegistry::with_builtin()),
                sink,
                config.retry_policy(),
            )?;

            let run = coordinator.run().await;
            print_summary(&run);

            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&run)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                info!(path = %path.display(), "Run report written");
            }

            Ok(if run.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        },
        Command::Plan { data_dir, sources } => {
            apply_overrides(&mut config, data_dir, sources);
            let manifest = config.manifest()?;
            print_plan(&manifest)?;
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn apply_overrides(config: &mut PipelineConfig, data_dir: Option<PathBuf>, sources: Option<PathBuf>) {
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if sources.is_some() {
        config.sources_file = sources;
    }
}

fn print_plan(manifest: &SourceManifest) -> Result<()> {
    let coordinator = RunCoordinator::from_manifest(
        manifest,
        Arc::new(DecoderRegistry::with_builtin()),
        Arc::new(MemoryWarehouse::new()),
        Default::default(),
    )?;

    println!("Execution layers:");
    for (i, layer) in coordinator.layers().iter().enumerate() {
        let tasks: Vec<String> = layer.iter().map(|t| t.to_string()).collect();
        println!("  {}. {}", i + 1, tasks.join(", "));
    }

    println!("\nSources:");
    for (name, files) in manifest.iter() {
        println!("  {} -> {}", name, name.table_name());
        for file in files {
            println!("    [{}] {}", file.format, file.path.display());
        }
    }
    Ok(())
}

fn print_summary(run: &RunReport) {
    match run.status {
        RunStatus::Succeeded => println!("Run {} succeeded", run.run_id),
        RunStatus::Failed { stage } => println!("Run {} failed at {} stage", run.run_id, stage),
    }

    for task in &run.tasks {
        let status = match task.status {
            TaskStatus::Succeeded => "ok",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "skipped",
        };
        let rows = match (task.rows_in, task.rows_out) {
            (Some(i), Some(o)) => format!("{} -> {} rows", i, o),
            (None, Some(o)) => format!("{} rows", o),
            _ => String::new(),
        };
        println!("  {:<30} {:<8} {}", task.task.to_string(), status, rows);
        if let Some(error) = &task.error {
            println!("    {}", error);
        }
    }

    for table in &run.tables {
        println!(
            "  table {:<24} {:?} ({} rows, {} attempts)",
            table.table, table.status, table.rows, table.attempts
        );
    }
}
