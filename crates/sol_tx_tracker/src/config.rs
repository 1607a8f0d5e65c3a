//! Tracker settings, loaded once at startup and validated before anything runs.
//!
//! Load from: an explicit path, env `SOL_TX_TRACKER_CONFIG`,
//! `./config/explorer_settings.json`, or `./explorer_settings.json`.

use crate::chain::classify::{default_rules, ClassifierRule};
use crate::chain::{Classifier, RetryPolicy, RpcConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const CONFIG_ENV: &str = "SOL_TX_TRACKER_CONFIG";
const SEARCH_PATHS: [&str; 2] = ["./config/explorer_settings.json", "./explorer_settings.json"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no config file found (set {CONFIG_ENV} or pass --config)")]
    NotFound,
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// JSON-RPC node URL (http or https). Required.
    pub rpc_endpoint: String,
    /// Initial backfill depth in batches when no start slot is configured.
    #[serde(default = "default_n_batches")]
    pub n_batches_to_explore: u64,
    /// Slots fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub start_slot: Option<u64>,
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    /// SQLite cache of finalized `getBlock` responses; disabled when unset.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub offline: bool,
    /// Replaces the built-in classification rules when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_rules: Option<Vec<ClassifierRule>>,
    /// Older settings files carry these; they are accepted and ignored.
    #[serde(default, skip_serializing)]
    jumps: Option<serde_json::Value>,
    #[serde(default, skip_serializing)]
    seconds_per_batch: Option<serde_json::Value>,
}

fn default_n_batches() -> u64 {
    5
}
fn default_batch_size() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    20
}
fn default_dataset_path() -> PathBuf {
    PathBuf::from("./data/dataset.json")
}
fn default_request_timeout() -> u64 {
    30
}
fn default_rate_limit_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl TrackerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        for (key, present) in [
            ("jumps", config.jumps.is_some()),
            ("seconds_per_batch", config.seconds_per_batch.is_some()),
        ] {
            if present {
                warn!(key, "ignoring legacy setting, use batch_size and poll_interval_seconds");
            }
        }
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Load from `explicit`, else the env var, else the search paths.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from_path(Path::new(&path));
        }
        SEARCH_PATHS
            .into_iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(Self::load_from_path)
            .unwrap_or(Err(ConfigError::NotFound))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(self.rpc_endpoint.trim())
            .map_err(|e| invalid("rpc_endpoint", e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(
                "rpc_endpoint",
                format!("unsupported scheme {}", url.scheme()),
            ));
        }
        for (field, value) in [
            ("batch_size", self.batch_size),
            ("n_batches_to_explore", self.n_batches_to_explore),
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("request_timeout_seconds", self.request_timeout_seconds),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.max_backoff_ms < self.retry_backoff_ms {
            return Err(invalid(
                "max_backoff_ms",
                "must not be smaller than retry_backoff_ms",
            ));
        }
        if self.dataset_path.as_os_str().is_empty() {
            return Err(invalid("dataset_path", "must not be empty"));
        }
        if let Some(rules) = &self.classifier_rules {
            if rules.iter().any(|r| r.tx_type.trim().is_empty()) {
                return Err(invalid("classifier_rules", "tx_type must not be empty"));
            }
        }
        Ok(())
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            endpoint: self.rpc_endpoint.trim().to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            rate_limit: Duration::from_millis(self.rate_limit_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_backoff_ms),
                max_delay: Duration::from_millis(self.max_backoff_ms),
            },
            offline: self.offline,
        }
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.classifier_rules.clone().unwrap_or_else(default_rules))
    }

    /// Slots behind the chain tip a fresh dataset starts at when no start slot is set.
    pub fn backfill_slots(&self) -> u64 {
        self.n_batches_to_explore.saturating_mul(self.batch_size)
    }

    /// First slot of a fresh dataset: the configured start, or `backfill_slots` behind
    /// `latest_slot`.
    pub fn start_cursor(&self, latest_slot: u64) -> u64 {
        self.start_slot
            .unwrap_or_else(|| latest_slot.saturating_sub(self.backfill_slots()))
    }
}
