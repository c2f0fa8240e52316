use thiserror::Error;

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Everything that can go wrong while handling one command. Each variant is
/// reported to the client as a single `error` line.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{command} not allowed. Available: {available}")]
    NotAllowed { command: String, available: String },

    #[error("empty command")]
    EmptyCommand,

    #[error("invalid command: unbalanced quotes")]
    UnbalancedQuotes,

    #[error("no such directory: {0}")]
    NoSuchDirectory(String),

    #[error("{0} is outside the executor root")]
    OutsideRoot(String),

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {}", exit_label(.code))]
    Exited { command: String, code: Option<i32> },

    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("executor busy: too many queued commands, try again when output settles")]
    Busy,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
