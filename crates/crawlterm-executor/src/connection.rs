use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crawlterm_protocol::{ClientMessage, ServerMessage};

use crate::error::ExecError;
use crate::server::AppState;

const REPLY_QUEUE: usize = 256;

#[derive(Debug)]
struct Job {
    command: String,
    directory: String,
}

/// Serve one client connection.
///
/// - A writer task owns the socket's send half; everything else talks to it
///   through an mpsc channel.
/// - A single worker runs queued commands one at a time, so commands from
///   one connection never overlap.
/// - The read loop answers pings itself and only enqueues commands, which
///   keeps heartbeats flowing while a command runs.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let id = Uuid::new_v4();
    info!(%id, "client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(REPLY_QUEUE);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match crawlterm_protocol::encode(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!(%id, error = %e, "dropping unencodable reply");
                    continue;
                }
            };
            if ws_sender.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let (jobs, mut queue) = mpsc::channel::<Job>(state.queue_depth.max(1));
    let worker = {
        let tx = tx.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                debug!(%id, command = %job.command, directory = %job.directory, "running");
                if let Err(e) = state.executor.run(&job.command, &job.directory, &tx).await {
                    debug!(%id, error = %e, "command failed");
                    if tx.send(ServerMessage::error(e.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        })
    };

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%id, "ws read error: {e}");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(_) => {
                reply(&tx, ServerMessage::error("invalid message: binary frames are not supported")).await;
                continue;
            }
            Message::Close(frame) => {
                debug!(%id, ?frame, "client closed");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let msg: ClientMessage = match crawlterm_protocol::decode(text.as_str()) {
            Ok(msg) => msg,
            Err(e) => {
                reply(&tx, ServerMessage::error(format!("invalid message: {e}"))).await;
                continue;
            }
        };

        match msg {
            ClientMessage::Ping { heartbeat, .. } => {
                reply(&tx, ServerMessage::pong(heartbeat)).await;
            }
            ClientMessage::Command { command, directory } => {
                match jobs.try_send(Job { command, directory }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(job)) => {
                        warn!(%id, command = %job.command, "queue full, rejecting command");
                        reply(&tx, ServerMessage::error(ExecError::Busy.to_string())).await;
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }

    // Kills any running child through kill_on_drop.
    worker.abort();
    drop(jobs);
    drop(tx);
    let _ = write_task.await;
    info!(%id, "client disconnected");
}

async fn reply(tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if tx.send(msg).await.is_err() {
        debug!("writer gone, reply dropped");
    }
}
