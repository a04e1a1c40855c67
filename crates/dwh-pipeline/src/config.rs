//! Pipeline configuration
//!
//! Settings come from the environment (a `.env` file is honored) with the
//! defaults below. The source manifest maps every dataset to its files and
//! can be overridden per dataset from a TOML file.

use dwh_common::{DatasetName, SourceFile, SourceFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default directory holding source files.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/dwh";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 4;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default schema destination tables are created in.
pub const DEFAULT_TARGET_SCHEMA: &str = "public";

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub sources_file: Option<PathBuf>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub target_schema: String,
    pub database: DatabaseConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = PipelineConfig {
            data_dir: std::env::var("DWH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            sources_file: std::env::var("DWH_SOURCES_FILE").ok().map(PathBuf::from),
            max_retries: env_or("DWH_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_delay_secs: env_or("DWH_RETRY_DELAY_SECS", DEFAULT_RETRY_DELAY_SECS),
            target_schema: std::env::var("DWH_TARGET_SCHEMA")
                .unwrap_or_else(|_| DEFAULT_TARGET_SCHEMA.to_string()),
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(PipelineError::Config("Database URL cannot be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(PipelineError::Config(
                "Database max_connections must be greater than 0".to_string(),
            ));
        }

        if !is_plain_identifier(&self.target_schema) {
            return Err(PipelineError::Config(format!(
                "Target schema '{}' must be a plain identifier",
                self.target_schema
            )));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }

    /// Built-in manifest, overridden by the sources file when one is set
    pub fn manifest(&self) -> Result<SourceManifest> {
        let manifest = SourceManifest::standard(&self.data_dir);
        match &self.sources_file {
            Some(path) => manifest.with_overrides_from(path, &self.data_dir),
            None => Ok(manifest),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            sources_file: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            target_schema: DEFAULT_TARGET_SCHEMA.to_string(),
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
        }
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Source Manifest
// ============================================================================

/// One dataset's entry in a sources file
#[derive(Debug, Clone, Deserialize)]
struct SourceGroup {
    format: String,
    files: Vec<PathBuf>,
}

/// Ordered source files for every dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceManifest {
    sources: BTreeMap<DatasetName, Vec<SourceFile>>,
}

impl SourceManifest {
    pub fn new(sources: BTreeMap<DatasetName, Vec<SourceFile>>) -> Self {
        Self { sources }
    }

    /// The file layout of a standard export, relative to `data_dir`
    pub fn standard(data_dir: &Path) -> Self {
        let file = |name: String, format: SourceFormat| SourceFile::new(data_dir.join(name), format);
        let parts = |prefix: &str, ext: &str, format: SourceFormat| -> Vec<SourceFile> {
            (0..10)
                .map(|i| file(format!("{}_{}.{}", prefix, i, ext), format))
                .collect()
        };

        let sources = BTreeMap::from([
            (
                DatasetName::Coupons,
                vec![file("coupons.json".into(), SourceFormat::Json)],
            ),
            (DatasetName::Customers, parts("customer", "csv", SourceFormat::Csv)),
            (DatasetName::Login, parts("login_attempts", "json", SourceFormat::Json)),
            (
                DatasetName::OrderItems,
                vec![file("order_item.avro".into(), SourceFormat::Avro)],
            ),
            (
                DatasetName::Orders,
                vec![file("order.parquet".into(), SourceFormat::Parquet)],
            ),
            (
                DatasetName::ProductCategories,
                vec![file("product_category.xls".into(), SourceFormat::Spreadsheet)],
            ),
            (
                DatasetName::Products,
                vec![file("product.xls".into(), SourceFormat::Spreadsheet)],
            ),
            (
                DatasetName::Suppliers,
                vec![file("supplier.xls".into(), SourceFormat::Spreadsheet)],
            ),
        ]);
        Self { sources }
    }

    /// Parse a TOML sources document; relative paths resolve against `data_dir`
    ///
    /// ```toml
    /// [customers]
    /// format = "csv"
    /// files = ["customer_0.csv", "customer_1.csv"]
    /// ```
    pub fn parse_overrides(content: &str, data_dir: &Path) -> Result<BTreeMap<DatasetName, Vec<SourceFile>>> {
        let groups: BTreeMap<DatasetName, SourceGroup> = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Invalid sources file: {}", e)))?;

        let mut sources = BTreeMap::new();
        for (name, group) in groups {
            let format: SourceFormat = group.format.parse()?;
            if group.files.is_empty() {
                return Err(PipelineError::Config(format!(
                    "Dataset {} lists no source files",
                    name
                )));
            }
            let files = group
                .files
                .into_iter()
                .map(|path| {
                    let path = if path.is_absolute() {
                        path
                    } else {
                        data_dir.join(path)
                    };
                    SourceFile::new(path, format)
                })
                .collect();
            sources.insert(name, files);
        }
        Ok(sources)
    }

    /// Replace the entries named in the TOML file at `path`
    pub fn with_overrides_from(mut self, path: &Path, data_dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read sources file {}: {}", path.display(), e))
        })?;
        self.sources.extend(Self::parse_overrides(&content, data_dir)?);
        Ok(self)
    }

    pub fn sources(&self, name: DatasetName) -> &[SourceFile] {
        self.sources.get(&name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (DatasetName, &[SourceFile])> {
        self.sources.iter().map(|(name, files)| (*name, files.as_slice()))
    }

    /// Datasets with no source files
    pub fn missing(&self) -> Vec<DatasetName> {
        DatasetName::ALL
            .into_iter()
            .filter(|name| self.sources(*name).is_empty())
            .collect()
    }
}
