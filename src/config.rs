//! Runtime configuration.
//!
//! Values come from an optional JSON file (path in `ORDER_DESK_CONFIG`) and are
//! then overridden by individual `ORDER_DESK_*` environment variables. Every
//! field has a default so an empty file, or no file at all, is valid apart
//! from the feed URL.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::api::normalize_feed_url;

pub const ENV_CONFIG_PATH: &str = "ORDER_DESK_CONFIG";
pub const ENV_FEED_URL: &str = "ORDER_DESK_FEED_URL";
pub const ENV_WARMUP_DELAY_MS: &str = "ORDER_DESK_WARMUP_DELAY_MS";
pub const ENV_STEADY_DELAY_MS: &str = "ORDER_DESK_STEADY_DELAY_MS";
pub const ENV_EMPTY_DELAY_MS: &str = "ORDER_DESK_EMPTY_DELAY_MS";
pub const ENV_ERROR_DELAY_MS: &str = "ORDER_DESK_ERROR_DELAY_MS";
pub const ENV_POLL_TIMEOUT_MS: &str = "ORDER_DESK_POLL_TIMEOUT_MS";
pub const ENV_ACTION_TIMEOUT_MS: &str = "ORDER_DESK_ACTION_TIMEOUT_MS";
pub const ENV_LOG_DIR: &str = "ORDER_DESK_LOG_DIR";

/// Upper bounds for the alert burst layout.
pub const MAX_ALERT_PULSES: u32 = 20;
pub const MAX_ALERT_STEP_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{key} must be a whole number of milliseconds (got {value:?})")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub warmup_ms: u64,
    pub steady_ms: u64,
    pub empty_response_ms: u64,
    pub error_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            warmup_ms: 1_000,
            steady_ms: 5_000,
            empty_response_ms: 6_000,
            error_ms: 15_000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub timeout_ms: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self { timeout_ms: 15_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub pulses: u32,
    pub interval_ms: u64,
    pub length_ms: u64,
    /// How long audio may stay suspended before the unlock prompt is shown.
    pub unlock_grace_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            pulses: 5,
            interval_ms: 400,
            length_ms: 200,
            unlock_grace_ms: 3_000,
        }
    }
}

impl AlertConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn length(&self) -> Duration {
        Duration::from_millis(self.length_ms)
    }

    pub fn unlock_grace(&self) -> Duration {
        Duration::from_millis(self.unlock_grace_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed_url: String,
    pub polling: PollingConfig,
    pub actions: ActionsConfig,
    pub alert: AlertConfig,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load from `ORDER_DESK_CONFIG` (if set), apply env overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "Reading config file");
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_string(ENV_FEED_URL) {
            self.feed_url = url;
        }
        if let Some(dir) = env_string(ENV_LOG_DIR) {
            self.log_dir = Some(PathBuf::from(dir));
        }
        let overrides: [(&'static str, &mut u64); 6] = [
            (ENV_WARMUP_DELAY_MS, &mut self.polling.warmup_ms),
            (ENV_STEADY_DELAY_MS, &mut self.polling.steady_ms),
            (ENV_EMPTY_DELAY_MS, &mut self.polling.empty_response_ms),
            (ENV_ERROR_DELAY_MS, &mut self.polling.error_ms),
            (ENV_POLL_TIMEOUT_MS, &mut self.polling.timeout_ms),
            (ENV_ACTION_TIMEOUT_MS, &mut self.actions.timeout_ms),
        ];
        for (key, slot) in overrides {
            if let Some(value) = env_string(key) {
                *slot = value
                    .parse()
                    .map_err(|_| ConfigError::Env { key, value })?;
            }
        }
        Ok(())
    }

    /// Normalise the feed URL and check the delay table is ordered.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.feed_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "feed_url is required (set {ENV_FEED_URL} or add it to the config file)"
            )));
        }
        self.feed_url = normalize_feed_url(&self.feed_url);
        reqwest::Url::parse(&self.feed_url)
            .map_err(|e| ConfigError::Invalid(format!("feed_url {:?}: {e}", self.feed_url)))?;

        let p = &self.polling;
        if p.steady_ms == 0 {
            return Err(ConfigError::Invalid("polling.steady_ms must be > 0".into()));
        }
        if !(p.steady_ms <= p.empty_response_ms && p.empty_response_ms <= p.error_ms) {
            return Err(ConfigError::Invalid(format!(
                "poll delays must satisfy steady <= empty_response <= error (got {} / {} / {})",
                p.steady_ms, p.empty_response_ms, p.error_ms
            )));
        }
        if p.timeout_ms == 0 || self.actions.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        let a = &self.alert;
        if a.pulses == 0 || a.pulses > MAX_ALERT_PULSES {
            return Err(ConfigError::Invalid(format!(
                "alert.pulses must be between 1 and {MAX_ALERT_PULSES} (got {})",
                a.pulses
            )));
        }
        if a.interval_ms > MAX_ALERT_STEP_MS || a.length_ms > MAX_ALERT_STEP_MS {
            return Err(ConfigError::Invalid(format!(
                "alert.interval_ms and alert.length_ms must be <= {MAX_ALERT_STEP_MS}"
            )));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
