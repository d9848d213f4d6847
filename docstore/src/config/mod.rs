use crate::error::{DocStoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Store configuration, typically parsed from a YAML file.
///
/// ```yaml
/// table: editions
/// database: books.db
/// compression:
///   algorithm: zstd
///   level: 9
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Name of the primary document table.
    #[serde(default = "default_table")]
    pub table: String,
    /// SQLite database file. In-memory when absent.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub compression: Compression,
}

/// Compression pass applied to encoded documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Compression {
    Zstd {
        #[serde(default = "default_zstd_level")]
        level: i32,
    },
    None,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd {
            level: default_zstd_level(),
        }
    }
}

fn default_table() -> String {
    "docs".to_string()
}

fn default_zstd_level() -> i32 {
    zstd::DEFAULT_COMPRESSION_LEVEL
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            table: default_table(),
            database: None,
            compression: Compression::default(),
        }
    }
}

impl StoreConfig {
    /// In-memory configuration for the given primary table.
    pub fn in_memory(table: &str) -> Self {
        StoreConfig {
            table: table.to_string(),
            ..StoreConfig::default()
        }
    }

    /// File-backed configuration for the given primary table.
    pub fn with_database(table: &str, path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            table: table.to_string(),
            database: Some(path.into()),
            ..StoreConfig::default()
        }
    }

    /// Parse a YAML config file. A relative `database` path is resolved
    /// against the directory containing the config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        if let (Some(db), Some(dir)) = (config.database.as_ref(), path.parent()) {
            if db.is_relative() {
                config.database = Some(dir.join(db));
            }
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        if config.table.is_empty() {
            return Err(DocStoreError::Config("table name must not be empty".into()));
        }
        Ok(config)
    }
}
