use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Command,
    Output,
    Error,
}

/// One entry of the operator's terminal. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLine {
    pub id: u64,
    pub kind: LineKind,
    pub content: String,
    pub timestamp_epoch_ms: u64,
}

impl fmt::Display for TerminalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LineKind::Command => write!(f, "$ {}", self.content),
            LineKind::Output => f.write_str(&self.content),
            LineKind::Error => write!(f, "! {}", self.content),
        }
    }
}

/// Changes to the log, broadcast to subscribers in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Appended(TerminalLine),
    Cleared,
}

/// Append-only line log. `clear` drops every line but ids keep increasing,
/// so an id is never reused within one client.
#[derive(Debug, Default)]
pub struct TerminalLog {
    lines: Vec<TerminalLine>,
    next_id: u64,
}

impl TerminalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, kind: LineKind, content: impl Into<String>) -> TerminalLine {
        let line = TerminalLine {
            id: self.next_id,
            kind,
            content: content.into(),
            timestamp_epoch_ms: now_epoch_ms(),
        };
        self.next_id += 1;
        self.lines.push(line.clone());
        line
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn lines(&self) -> &[TerminalLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
