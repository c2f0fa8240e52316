use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crawlterm_client::{ClientConfig, LogEvent, SessionClient, WsConnector, display_dir};

#[derive(Parser, Debug)]
#[command(name = "crawlterm", about = "Operator terminal for a crawlterm executor")]
struct Args {
    /// Executor websocket URL
    #[arg(long)]
    url: Option<String>,

    /// Config file (defaults to ~/.config/crawlterm/client.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory to start from
    #[arg(long)]
    directory: Option<String>,

    /// Force a reconnect after this many unanswered heartbeats
    #[arg(long)]
    max_missed_heartbeats: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crawlterm=warn,crawlterm_client=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ClientConfig::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(directory) = args.directory {
        config.initial_directory = directory;
    }
    if args.max_missed_heartbeats.is_some() {
        config.max_missed_heartbeats = args.max_missed_heartbeats;
    }

    let client = SessionClient::spawn(config, WsConnector);
    let printer = tokio::spawn(print_lines(client.subscribe()));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt(&client).await;
        let Some(line) = stdin.next_line().await.context("failed to read stdin")? else {
            break;
        };
        if matches!(line.trim(), "exit" | "quit") {
            break;
        }
        client.submit(line).await?;
    }

    client.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn prompt(client: &SessionClient) {
    let Ok(snapshot) = client.snapshot().await else {
        return;
    };
    let dir = display_dir(&snapshot.working_directory);
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "[{}] {dir}> ", snapshot.state);
    let _ = out.flush();
}

async fn print_lines(mut events: broadcast::Receiver<LogEvent>) {
    loop {
        match events.recv().await {
            Ok(LogEvent::Appended(line)) => println!("{line}"),
            Ok(LogEvent::Cleared) => print!("\x1b[2J\x1b[H"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("({n} lines skipped)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
