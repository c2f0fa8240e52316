pub mod paths;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base commands the executor will run. Both sides must be redeployed to
/// change this list.
pub const ALLOWED_COMMANDS: [&str; 7] = ["scrapy", "crontab", "pwd", "less", "cd", "ls", "clear"];

/// Commands interpreted by the client that never reach the wire.
pub const META_COMMANDS: [&str; 5] = ["clear", "test", "ping", "debug", "reconnect"];

/// Normal closure; the client never reconnects after it.
pub const CLOSE_NORMAL: u16 = 1000;
/// Abnormal closure (no close frame received, or the dial failed).
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Client-initiated close after too many silent heartbeat intervals.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Marker carried by a pong that acknowledges a heartbeat ping.
pub const HEARTBEAT_MARKER: &str = "heartbeat";

/// Upper bound for a single encoded wire message.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

pub const DEFAULT_WS_PATH: &str = "/ws/terminal";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8790";

/// Client-to-executor messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run an allow-listed command with `directory` as working context.
    Command { command: String, directory: String },
    /// Liveness check. Heartbeat pings are answered with a marked pong.
    Ping {
        timestamp: u64,
        #[serde(default)]
        heartbeat: bool,
    },
}

/// Executor-to-client messages sent as JSON text frames.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One line of command stdout.
    Output { content: String },
    /// One line of stderr, or an execution/validation failure.
    Error { content: String },
    /// Acknowledges a `cd`; the client adopts `directory` verbatim.
    DirectoryChanged { directory: String },
    Ping { content: String },
    Pong { content: String },
}

impl ServerMessage {
    pub fn output(content: impl Into<String>) -> Self {
        Self::Output {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    /// Reply to a ping, tagged as a heartbeat acknowledgment when asked.
    pub fn pong(heartbeat: bool) -> Self {
        let content = if heartbeat {
            format!("{HEARTBEAT_MARKER} ack")
        } else {
            "pong".to_string()
        };
        Self::Pong { content }
    }

    pub fn is_heartbeat_ack(&self) -> bool {
        matches!(self, Self::Pong { content } if content.contains(HEARTBEAT_MARKER))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
}

/// Encode a wire message as a single JSON text frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(msg)?;
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            len: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(text)
}

/// Decode a JSON text frame into a wire message.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            len: text.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(serde_json::from_str(text.trim())?)
}

/// First whitespace-separated token of a command line.
pub fn base_command(raw: &str) -> Option<&str> {
    raw.split_whitespace().next()
}

pub fn is_allowed(base: &str) -> bool {
    ALLOWED_COMMANDS.contains(&base)
}

pub fn is_meta(command: &str) -> bool {
    META_COMMANDS.contains(&command)
}

/// Human-readable allow-list used in rejection messages.
pub fn available_commands() -> String {
    ALLOWED_COMMANDS.join(", ")
}

/// Standard rejection text for a base command outside the allow-list.
pub fn not_allowed_message(base: &str) -> String {
    format!("{base} not allowed. Available: {}", available_commands())
}
