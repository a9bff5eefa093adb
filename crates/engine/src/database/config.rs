//! Node configuration via `chronicle.toml`
//!
//! On first open of a configuration directory a default `chronicle.toml` is
//! written. To change settings, edit the file and reopen the node.

use chronicle_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the configuration directory.
pub const CONFIG_FILE_NAME: &str = "chronicle.toml";

/// What happens to historic row states nobody can read any more
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRetention {
    /// Keep every state forever
    All,
    /// Drop states below the watermark on every session advance
    Watermark,
}

/// Node configuration loaded from `chronicle.toml`.
///
/// # Example
///
/// ```toml
/// node_name = "node-a"
/// author = "billing-service"
/// refetch_timeout_ms = 120000
/// revision_sequence = "revision"
/// history_retention = "all"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name of this node in logs.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Author recorded on every revision this node commits.
    #[serde(default = "default_author")]
    pub author: String,
    /// Default `refetch` timeout in milliseconds.
    #[serde(default = "default_refetch_timeout_ms")]
    pub refetch_timeout_ms: u64,
    /// Name of the sequence revisions are drawn from.
    #[serde(default = "default_revision_sequence")]
    pub revision_sequence: String,
    /// History retention: `"all"` or `"watermark"`.
    #[serde(default = "default_history_retention")]
    pub history_retention: String,
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_author() -> String {
    "chronicle".to_string()
}

fn default_refetch_timeout_ms() -> u64 {
    120_000
}

fn default_revision_sequence() -> String {
    "revision".to_string()
}

fn default_history_retention() -> String {
    "all".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            author: default_author(),
            refetch_timeout_ms: default_refetch_timeout_ms(),
            revision_sequence: default_revision_sequence(),
            history_retention: default_history_retention(),
        }
    }
}

impl DatabaseConfig {
    /// Parse the retention string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"all"` or `"watermark"`.
    pub fn retention(&self) -> Result<HistoryRetention> {
        match self.history_retention.as_str() {
            "all" => Ok(HistoryRetention::All),
            "watermark" => Ok(HistoryRetention::Watermark),
            other => Err(Error::invalid_operation(format!(
                "invalid history_retention '{}' in {}, expected \"all\" or \"watermark\"",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Default refetch timeout
    pub fn refetch_timeout(&self) -> Duration {
        Duration::from_millis(self.refetch_timeout_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Chronicle node configuration
#
# Name of this node in logs
node_name = "node"

# Author recorded on every revision this node commits
author = "chronicle"

# How long refetch() waits for a revision from another node (default: 2 minutes)
refetch_timeout_ms = 120000

# Sequence the revision numbers are drawn from
revision_sequence = "revision"

# History retention: "all" (default) or "watermark"
#   "all"       = keep every historic state
#   "watermark" = drop states no live session, item or iterator can read
history_retention = "all"
"#
    }

    /// Load the config of a directory, writing the default file first if
    /// there is none.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::storage(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: DatabaseConfig = toml::from_str(&content).map_err(|e| {
            Error::invalid_operation(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.retention()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::storage(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::storage(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
