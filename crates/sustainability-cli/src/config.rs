use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sustainability_store_sqlite::StoreOptions;

/// Runtime settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub busy_timeout_ms: u64,
    pub max_conflict_retries: u32,
    pub artifact_dir: Option<PathBuf>,
    pub log_filter: String,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let store = StoreOptions::default();
        Self {
            busy_timeout_ms: store.busy_timeout_ms,
            max_conflict_retries: store.max_conflict_retries,
            artifact_dir: None,
            log_filter: "info".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    /// Returns an error for malformed TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid engine config TOML")
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `busy_timeout_ms` is zero or `log_filter` is empty.
    pub fn validate(&self) -> Result<()> {
        if self.busy_timeout_ms == 0 {
            return Err(anyhow!("busy_timeout_ms MUST be > 0"));
        }
        if self.log_filter.trim().is_empty() {
            return Err(anyhow!("log_filter MUST NOT be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout_ms: self.busy_timeout_ms,
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}
