use std::path::PathBuf;

/// Returns the config directory path for crawlterm.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("crawlterm")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("crawlterm")
    } else {
        PathBuf::from("/tmp/crawlterm")
    }
}

/// Returns the config file path for the operator client.
pub fn client_config_path() -> PathBuf {
    dirs_path().join("client.toml")
}

/// Returns the config file path for the host executor.
pub fn executor_config_path() -> PathBuf {
    dirs_path().join("executor.toml")
}
