//! Client-side command gate.
//!
//! Every submitted line is classified here before anything touches the
//! transport. Rejected commands are never transmitted, whatever the executor
//! would have done with them.

use std::fmt;

use crawlterm_protocol::{base_command, is_allowed, not_allowed_message};

/// Commands handled entirely by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaCommand {
    Clear,
    Test,
    Ping,
    Debug,
    Reconnect,
}

impl MetaCommand {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "clear" => Some(Self::Clear),
            "test" => Some(Self::Test),
            "ping" => Some(Self::Ping),
            "debug" => Some(Self::Debug),
            "reconnect" => Some(Self::Reconnect),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Test => "test",
            Self::Ping => "ping",
            Self::Debug => "debug",
            Self::Reconnect => "reconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Blank input. Dropped without a trace.
    Empty,
    NotAllowed { base: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty command"),
            Self::NotAllowed { base } => f.write_str(&not_allowed_message(base)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Allowed on the wire; carries the trimmed command line.
    Accepted(String),
    Rejected(Rejection),
    LocalMeta(MetaCommand),
}

pub fn validate(raw: &str) -> Verdict {
    let trimmed = raw.trim();
    let Some(base) = base_command(trimmed) else {
        return Verdict::Rejected(Rejection::Empty);
    };
    if let Some(meta) = MetaCommand::parse(trimmed) {
        return Verdict::LocalMeta(meta);
    }
    if is_allowed(base) {
        Verdict::Accepted(trimmed.to_string())
    } else {
        Verdict::Rejected(Rejection::NotAllowed {
            base: base.to_string(),
        })
    }
}
