use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crawlterm_protocol::MAX_MESSAGE_BYTES;

use crate::config::ExecutorConfig;
use crate::connection;
use crate::exec::Executor;

/// State shared by every connection. Read-only: connections never see each
/// other's directories or processes.
#[derive(Debug)]
pub struct AppState {
    pub executor: Executor,
    pub queue_depth: usize,
}

pub fn router(config: &ExecutorConfig) -> anyhow::Result<Router> {
    config.validate()?;
    let executor = Executor::new(config).context("invalid executor root")?;
    let state = Arc::new(AppState {
        executor,
        queue_depth: config.queue_depth,
    });
    Ok(Router::new()
        .route(&config.path, get(ws_handler))
        .with_state(state))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Serve on an already bound listener until `shutdown` turns true or its
/// sender goes away.
pub async fn serve(
    listener: TcpListener,
    config: &ExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(config)?;
    let addr = listener.local_addr()?;
    info!(%addr, path = %config.path, root = %config.root.display(), "crawlterm executor listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("executor stopped");
    Ok(())
}

pub async fn run(config: ExecutorConfig) -> anyhow::Result<()> {
    let listener = bind(config.listen).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down...");
        shutdown_tx.send_replace(true);
    });

    serve(listener, &config, shutdown_rx).await
}

async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind executor listener on {addr}"))
}
