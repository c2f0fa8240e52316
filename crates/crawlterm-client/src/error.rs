use crawlterm_protocol::CodecError;
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("config error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Errors the reconnect policy is expected to recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io(_))
    }
}
