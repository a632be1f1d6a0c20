//! Monitor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use queue_core::AliasMap;
use serde::Deserialize;
use thiserror::Error;

/// Environment variables that override file settings.
pub const ENV_SERVER_URL: &str = "QSERVER_HTTP_URL";
pub const ENV_API_KEY: &str = "QSERVER_API_KEY";
pub const ENV_POLL_INTERVAL_MS: &str = "QSERVER_POLL_INTERVAL_MS";
pub const ENV_REMOTE_TIMEOUT_MS: &str = "QSERVER_REMOTE_TIMEOUT_MS";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Monitor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Base URL of the queue server's REST gateway.
    pub server_url: String,
    /// Optional API key sent as `Authorization: ApiKey <key>`.
    pub api_key: Option<String>,
    /// Delay between polls.
    pub poll_interval_ms: u64,
    /// Upper bound for any single remote call.
    pub remote_timeout_ms: u64,
    /// Logical columns and the record keys that may hold them.
    pub roi_key_map: AliasMap,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:60610".to_string(),
            api_key: None,
            poll_interval_ms: 2000,
            remote_timeout_ms: 10_000,
            roi_key_map: AliasMap::default(),
            event_capacity: 1024,
        }
    }
}

impl MonitorConfig {
    /// Load a YAML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)?.with_env()
    }

    /// Parse YAML without looking at the environment.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`.
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            self.server_url = url.trim().to_string();
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_millis(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_REMOTE_TIMEOUT_MS) {
            self.remote_timeout_ms = parse_millis(ENV_REMOTE_TIMEOUT_MS, &value)?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.remote_timeout_ms == 0 {
            return Err(ConfigError::Invalid("remote_timeout_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        Ok(self)
    }

    /// Set the server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Set the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    /// Set the alias map.
    pub fn with_aliases(mut self, aliases: AliasMap) -> Self {
        self.roi_key_map = aliases;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        })
}
