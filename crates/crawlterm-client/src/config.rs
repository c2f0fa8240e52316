use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crawlterm_protocol::{DEFAULT_LISTEN_ADDR, DEFAULT_WS_PATH};

use crate::error::{ClientError, ClientResult};
use crate::transport::ReconnectPolicy;

/// Operator client settings. Every field is optional in the TOML file.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Executor endpoint, e.g. `ws://127.0.0.1:8790/ws/terminal`.
    pub url: String,
    /// Delay between startup and the first connection attempt.
    pub startup_grace_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Silent heartbeat intervals tolerated before forcing a reconnect.
    /// `None` keeps liveness advisory.
    pub max_missed_heartbeats: Option<u32>,
    /// Working directory sent with commands until the executor reports a
    /// change. Empty means the executor's root.
    pub initial_directory: String,
    pub log_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://{DEFAULT_LISTEN_ADDR}{DEFAULT_WS_PATH}"),
            startup_grace_ms: 500,
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
            heartbeat_interval_ms: 30_000,
            max_missed_heartbeats: None,
            initial_directory: String::new(),
            log_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> ClientResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (crawlterm_protocol::paths::client_config_path(), false),
        };
        if !path.exists() {
            if explicit {
                return Err(ClientError::Config {
                    message: format!("config file not found: {}", path.display()),
                });
            }
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> ClientResult<Self> {
        toml::from_str(contents).map_err(|e| ClientError::Config {
            message: e.to_string(),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}
