use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crawlterm_executor::ExecutorConfig;

#[derive(Parser, Debug)]
#[command(name = "crawlterm-executor", about = "Runs allow-listed commands for crawlterm clients")]
struct Args {
    /// Config file (defaults to ~/.config/crawlterm/executor.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory commands start in
    #[arg(long)]
    root: Option<PathBuf>,

    /// Per-command timeout in seconds, 0 to disable
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Look up programs in this directory instead of PATH
    #[arg(long)]
    bin_dir: Option<PathBuf>,

    /// Allow cd outside the root directory
    #[arg(long)]
    unconfined: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "crawlterm_executor=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config =
        ExecutorConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(secs) = args.timeout_secs {
        config.command_timeout_secs = secs;
    }
    if args.bin_dir.is_some() {
        config.bin_dir = args.bin_dir;
    }
    if args.unconfined {
        config.confine_to_root = false;
    }

    crawlterm_executor::run(config).await
}
