//! Worker options
//!
//! Loaded from YAML (every field optional), then overridden from the
//! environment:
//!
//! ```yaml
//! account_sid: AC...
//! workspace_sid: WS...
//! worker_sid: WK...
//! ws_server: "wss://event-bridge.example.com/v1/wschannels/{accountSid}/{workerSid}"
//! api_base_url: "https://taskrouter.example.com"
//! connect_activity_sid: WA...
//! removal_grace_ms: 5000
//! channel:
//!   heartbeat_interval_ms: 30000
//!   max_reconnect_attempts: 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_TOKEN: &str = "TASKROUTER_TOKEN";
pub const ENV_WS_SERVER: &str = "TASKROUTER_WS_SERVER";
pub const ENV_API_BASE: &str = "TASKROUTER_API_BASE";

/// Signaling channel tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Keepalive frame interval
    pub heartbeat_interval_ms: u64,
    /// Reconnect when nothing arrives for this long
    pub heartbeat_timeout_ms: u64,
    /// First reconnect delay; doubles per consecutive failure
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed connects before giving up. Losing an open
    /// connection always gets a reconnect. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_reconnect_attempts: Some(10),
        }
    }
}

impl ChannelOptions {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Options for one worker session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub account_sid: String,
    pub workspace_sid: String,
    pub worker_sid: String,
    /// Access token, acquired elsewhere
    #[serde(skip_serializing)]
    pub token: String,
    /// Channel URL template; `{accountSid}` and `{workerSid}` are expanded
    pub ws_server: String,
    pub api_base_url: String,
    /// Activity to move to after the first successful sync
    pub connect_activity_sid: Option<String>,
    /// How long a terminal reservation waits for its task's terminal event
    pub removal_grace_ms: u64,
    pub request_timeout_ms: u64,
    pub channel: ChannelOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            workspace_sid: String::new(),
            worker_sid: String::new(),
            token: String::new(),
            ws_server: String::new(),
            api_base_url: String::new(),
            connect_activity_sid: None,
            removal_grace_ms: 5_000,
            request_timeout_ms: 30_000,
            channel: ChannelOptions::default(),
        }
    }
}

impl WorkerOptions {
    /// `~/.taskrouter/worker.yaml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".taskrouter"))
            .unwrap_or_else(|| PathBuf::from(".taskrouter"))
            .join("worker.yaml")
    }

    /// Load from YAML. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TASKROUTER_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_TOKEN) {
            self.token = v;
        }
        if let Some(v) = lookup(ENV_WS_SERVER) {
            self.ws_server = v;
        }
        if let Some(v) = lookup(ENV_API_BASE) {
            self.api_base_url = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_sid.is_empty() {
            return Err(ConfigError::Missing("worker_sid"));
        }
        if self.ws_server.is_empty() {
            return Err(ConfigError::Missing("ws_server"));
        }
        Ok(())
    }

    /// Channel URL with placeholders expanded
    pub fn channel_url(&self) -> String {
        self.ws_server
            .replace("{accountSid}", &self.account_sid)
            .replace("{workerSid}", &self.worker_sid)
    }

    /// Headers sent when opening the channel
    pub fn channel_headers(&self) -> Vec<(String, String)> {
        if self.token.is_empty() {
            return Vec::new();
        }
        vec![("Authorization".to_string(), format!("Bearer {}", self.token))]
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }
}
