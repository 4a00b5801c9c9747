//! Execution configuration.
//!
//! Loaded from a TOML document, with every key optional.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunables of the execution engine.
///
/// Example:
/// ```toml
/// temp_row_holder_threshold = 5
/// bulk_fetch_size = 16
/// collect_statistics = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Rows a temporary row holder keeps in memory before it spills into
    /// a temporary conglomerate.
    pub temp_row_holder_threshold: usize,
    /// Rows fetched from the store per call by a bulk table scan.
    pub bulk_fetch_size: usize,
    /// Accumulate open, next and close timings in every result set.
    pub collect_statistics: bool,
    /// Rows processed by a scan between two checks of the cancellation flag.
    pub cancel_check_interval: u64,
    /// The initial capacity of hash tables built by hash scans.
    pub hash_table_initial_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            temp_row_holder_threshold: 5,
            bulk_fetch_size: 16,
            collect_statistics: false,
            cancel_check_interval: 1,
            hash_table_initial_capacity: 64,
        }
    }
}

impl ExecConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).context("invalid execution configuration")?;
        anyhow::ensure!(config.bulk_fetch_size > 0, "`bulk_fetch_size` must be positive");
        anyhow::ensure!(config.cancel_check_interval > 0, "`cancel_check_interval` must be positive");
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }
}
