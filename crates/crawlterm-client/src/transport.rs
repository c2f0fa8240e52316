//! Connection state machine.
//!
//! `TransportSession` owns no sockets or timers. Every event is fed through
//! [`TransportSession::handle`], which updates the state and returns the
//! [`Action`]s the driver must carry out. The session actor is the only
//! driver, so transitions are serialized.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crawlterm_protocol::{CLOSE_ABNORMAL, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bounded exponential backoff. `attempt` only goes back to zero through
/// [`ReconnectPolicy::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(16))
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mult = 1u64 << attempt.min(31);
        let millis = self.base_delay.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.max_delay.as_millis() as u64))
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// How a physical connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            was_clean: true,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }

    /// Deliberate shutdown by either side; never followed by a reconnect.
    pub fn is_normal(&self) -> bool {
        self.was_clean || self.code == CLOSE_NORMAL
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Request a connection, optionally after `delay`.
    Connect { delay: Duration },
    /// The armed reconnect timer fired.
    ReconnectDue,
    /// The pending dial produced an open link.
    Opened,
    /// The link closed, or the dial failed.
    Closed(CloseInfo),
    /// Too many heartbeat intervals passed without an acknowledgment.
    LivenessLost,
    /// Operator asked for a fresh connection with a reset attempt counter.
    ManualReconnect,
    /// Teardown. Terminal for this session.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ArmReconnect(Duration),
    CancelReconnect,
    Dial,
    /// Send a close frame and keep listening for the peer's close.
    CloseLink { code: u16, reason: String },
    /// Send a close frame, then forget the link and any pending dial.
    DropLink { code: u16, reason: String },
    StartHeartbeat,
    StopHeartbeat,
    Notify(Notice),
}

/// Transitions the operator should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    ReconnectScheduled {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        code: u16,
    },
    GaveUp {
        max_attempts: u32,
    },
    ClosedNormally {
        code: u16,
        reason: String,
    },
}

#[derive(Debug)]
pub struct TransportSession {
    state: ConnectionState,
    policy: ReconnectPolicy,
    reconnect_armed: bool,
    shutting_down: bool,
}

impl TransportSession {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            reconnect_armed: false,
            shutting_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_armed
    }

    /// A dial is running or armed.
    pub fn connect_in_flight(&self) -> bool {
        self.state == ConnectionState::Connecting || self.reconnect_armed
    }

    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        let before = self.state;
        let actions = match input {
            Input::Connect { delay } => self.on_connect(delay),
            Input::ReconnectDue => self.on_reconnect_due(),
            Input::Opened => self.on_opened(),
            Input::Closed(info) => self.on_closed(info),
            Input::LivenessLost => self.on_liveness_lost(),
            Input::ManualReconnect => self.on_manual_reconnect(),
            Input::Disconnect => self.on_disconnect(),
        };
        if before != self.state {
            debug!(from = %before, to = %self.state, attempt = self.policy.attempt, "transport state");
        }
        actions
    }

    fn on_connect(&mut self, delay: Duration) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        if self.connect_in_flight()
            || matches!(self.state, ConnectionState::Open | ConnectionState::Closing)
        {
            debug!(state = %self.state, "connect ignored, connection already in flight");
            return Vec::new();
        }
        if self.policy.exhausted() {
            return vec![Action::Notify(Notice::GaveUp {
                max_attempts: self.policy.max_attempts,
            })];
        }
        if delay.is_zero() {
            self.state = ConnectionState::Connecting;
            vec![Action::Dial]
        } else {
            self.reconnect_armed = true;
            vec![Action::ArmReconnect(delay)]
        }
    }

    fn on_reconnect_due(&mut self) -> Vec<Action> {
        if !self.reconnect_armed || self.shutting_down {
            return Vec::new();
        }
        self.reconnect_armed = false;
        self.state = ConnectionState::Connecting;
        vec![Action::Dial]
    }

    fn on_opened(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.state = ConnectionState::Open;
        self.policy.reset();
        vec![Action::StartHeartbeat, Action::Notify(Notice::Connected)]
    }

    fn on_closed(&mut self, info: CloseInfo) -> Vec<Action> {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.state == ConnectionState::Open {
            actions.push(Action::StopHeartbeat);
        }
        self.state = ConnectionState::Closed;

        if self.shutting_down {
            return actions;
        }
        if info.is_normal() {
            actions.push(Action::Notify(Notice::ClosedNormally {
                code: info.code,
                reason: info.reason,
            }));
            return actions;
        }
        if self.reconnect_armed {
            return actions;
        }
        if self.policy.exhausted() {
            actions.push(Action::Notify(Notice::GaveUp {
                max_attempts: self.policy.max_attempts,
            }));
            return actions;
        }

        let delay = self.policy.delay_for(self.policy.attempt);
        self.policy.attempt += 1;
        self.reconnect_armed = true;
        actions.push(Action::ArmReconnect(delay));
        actions.push(Action::Notify(Notice::ReconnectScheduled {
            attempt: self.policy.attempt,
            max_attempts: self.policy.max_attempts,
            delay,
            code: info.code,
        }));
        actions
    }

    fn on_liveness_lost(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::Open || self.shutting_down {
            return Vec::new();
        }
        let reason = "heartbeat timeout";
        let mut actions = vec![Action::DropLink {
            code: CLOSE_HEARTBEAT_TIMEOUT,
            reason: reason.to_string(),
        }];
        actions.extend(self.on_closed(CloseInfo {
            code: CLOSE_HEARTBEAT_TIMEOUT,
            reason: reason.to_string(),
            was_clean: false,
        }));
        actions
    }

    fn on_manual_reconnect(&mut self) -> Vec<Action> {
        if self.shutting_down {
            return Vec::new();
        }
        self.policy.reset();
        let mut actions = Vec::new();
        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(Action::CancelReconnect);
        }
        if self.state == ConnectionState::Open {
            actions.push(Action::StopHeartbeat);
        }
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Closing
        ) {
            actions.push(Action::DropLink {
                code: CLOSE_NORMAL,
                reason: "manual reconnect".to_string(),
            });
        }
        self.state = ConnectionState::Connecting;
        actions.push(Action::Dial);
        actions
    }

    fn on_disconnect(&mut self) -> Vec<Action> {
        self.shutting_down = true;
        let mut actions = Vec::new();
        if self.reconnect_armed {
            self.reconnect_armed = false;
            actions.push(Action::CancelReconnect);
        }
        match self.state {
            ConnectionState::Open => {
                actions.push(Action::StopHeartbeat);
                actions.push(Action::CloseLink {
                    code: CLOSE_NORMAL,
                    reason: "client disconnect".to_string(),
                });
                self.state = ConnectionState::Closing;
            }
            ConnectionState::Connecting => {
                actions.push(Action::DropLink {
                    code: CLOSE_NORMAL,
                    reason: "client disconnect".to_string(),
                });
                self.state = ConnectionState::Closed;
            }
            ConnectionState::Closing => {}
            ConnectionState::Idle | ConnectionState::Closed => {
                self.state = ConnectionState::Closed;
            }
        }
        actions
    }
}
