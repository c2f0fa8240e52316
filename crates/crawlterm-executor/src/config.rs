use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crawlterm_protocol::DEFAULT_WS_PATH;

const DEFAULT_PORT: u16 = 8790;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    pub listen: SocketAddr,
    /// Route the websocket endpoint is mounted on.
    pub path: String,
    /// Directory commands start in, and the boundary `cd` may not leave
    /// while `confine_to_root` is set.
    pub root: PathBuf,
    pub confine_to_root: bool,
    /// Per-command limit; `0` disables it.
    pub command_timeout_secs: u64,
    /// Commands a single connection may have waiting behind the running one.
    pub queue_depth: usize,
    pub max_output_line_bytes: usize,
    /// Look up programs here instead of `PATH`.
    pub bin_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            path: DEFAULT_WS_PATH.to_string(),
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            confine_to_root: true,
            command_timeout_secs: 300,
            queue_depth: 8,
            max_output_line_bytes: 16 * 1024,
            bin_dir: None,
        }
    }
}

impl ExecutorConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => crawlterm_protocol::paths::executor_config_path(),
        };
        if !config_path.exists() {
            if path.is_some() {
                bail!("config file not found: {}", config_path.display());
            }
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config in {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.path.starts_with('/') {
            bail!("websocket path must start with '/': {}", self.path);
        }
        if self.max_output_line_bytes == 0 {
            bail!("max_output_line_bytes must be positive");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}
