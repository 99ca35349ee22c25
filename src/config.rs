//! Runtime configuration: defaults, then an optional TOML file, then
//! environment overrides.
//!
//! Caps, TTLs and the retry ceiling are fixed policy and deliberately absent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{CompanionError, Result};
use crate::flat_store::DEFAULT_QUOTA_BYTES;
use crate::local_db_state::DEFAULT_MAP_SIZE;
use crate::retry_queue::DEFAULT_POLL_INTERVAL;
use crate::upstream::DEFAULT_API_BASE_URL;

pub const ENV_DATA_DIR: &str = "DOTA_COMPANION_DATA_DIR";
pub const ENV_API_URL: &str = "DOTA_COMPANION_API_URL";
pub const ENV_TIMEOUT_MS: &str = "DOTA_COMPANION_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub data_dir: PathBuf,
    /// The LMDB environment lives in `<data_dir>/<database_name>.lmdb`.
    pub database_name: String,
    pub flat_namespace: String,
    pub flat_quota_bytes: u64,
    pub lmdb_map_size: usize,
    pub api_base_url: String,
    pub request_timeout_ms: u64,
    pub retry_interval_secs: u64,
    pub cache_sweep_interval_secs: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dota_companion_data"),
            database_name: "dota2_companion".to_string(),
            flat_namespace: "dota2_companion".to_string(),
            flat_quota_bytes: DEFAULT_QUOTA_BYTES,
            lmdb_map_size: DEFAULT_MAP_SIZE,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_ms: 5_000,
            retry_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            cache_sweep_interval_secs: 60 * 60,
        }
    }
}

impl CompanionConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| CompanionError::Validation(format!("invalid TOML config: {e}")))
    }

    /// JSON counterpart of [`CompanionConfig::load`]: defaults, overlaid by
    /// `contents`, overlaid by the environment.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(contents)
            .map_err(|e| CompanionError::Validation(format!("invalid JSON config: {e}")))?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let contents = std::fs::read_to_string(path)?;
                Self::from_toml_str(&contents)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DOTA_COMPANION_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            self.request_timeout_ms = raw.trim().parse().map_err(|e| {
                CompanionError::Validation(format!("{ENV_TIMEOUT_MS}='{raw}' is not a number: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_name.trim().is_empty() || self.flat_namespace.trim().is_empty() {
            return Err(CompanionError::Validation(
                "database_name and flat_namespace must not be empty".to_string(),
            ));
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(CompanionError::Validation(format!(
                "api_base_url must be an http(s) URL, got '{}'",
                self.api_base_url
            )));
        }
        if self.request_timeout_ms == 0
            || self.retry_interval_secs == 0
            || self.cache_sweep_interval_secs == 0
        {
            return Err(CompanionError::Validation(
                "timeouts and intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn structured_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lmdb", self.database_name))
    }

    pub fn flat_dir(&self) -> PathBuf {
        self.data_dir.join("flat")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}
