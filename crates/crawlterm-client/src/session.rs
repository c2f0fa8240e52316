//! Session client.
//!
//! A single actor task owns the transport state machine, the heartbeat, the
//! line log and the working directory. Callers talk to it through
//! [`SessionClient`]; every mutation happens inside the actor loop, one event
//! at a time.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crawlterm_protocol::{ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::gate::{self, MetaCommand, Rejection, Verdict};
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::link::{Connector, Link, LinkEvent};
use crate::log::{LineKind, LogEvent, TerminalLine, TerminalLog};
use crate::transport::{Action, CloseInfo, ConnectionState, Input, Notice, TransportSession};

/// How long teardown waits for the executor to acknowledge a close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_QUEUE: usize = 64;

/// Point-in-time view of the session, for prompts and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub reconnect_pending: bool,
    pub heartbeat_active: bool,
    pub working_directory: String,
    pub line_count: usize,
}

enum Request {
    Submit(String),
    Lines(oneshot::Sender<Vec<TerminalLine>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session.
pub struct SessionClient {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<LogEvent>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Start the session. The first connection attempt happens after the
    /// configured startup grace period.
    pub fn spawn<C: Connector>(config: ClientConfig, connector: C) -> Self {
        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(config.log_capacity.max(1));

        let actor = SessionActor::new(config, Arc::new(connector), state_tx, events.clone());
        let task = tokio::spawn(actor.run(request_rx));

        Self {
            requests,
            state,
            events,
            task,
        }
    }

    /// Queue a raw operator line. Responses arrive asynchronously as lines.
    pub async fn submit(&self, raw: impl Into<String>) -> ClientResult<()> {
        self.requests
            .send(Request::Submit(raw.into()))
            .await
            .map_err(|_| ClientError::SessionClosed)
    }

    pub async fn lines(&self) -> ClientResult<Vec<TerminalLine>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Lines(tx))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    pub async fn snapshot(&self) -> ClientResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot(tx))
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Close the connection normally and stop every timer. No reconnect or
    /// heartbeat fires once this returns.
    pub async fn shutdown(self) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| ClientError::transport(format!("session task failed: {e}")))
    }
}

type PendingDial = BoxFuture<'static, ClientResult<Link>>;

enum Wake {
    Request(Option<Request>),
    Startup,
    ReconnectDue,
    Dialed(ClientResult<Link>),
    Link(Option<LinkEvent>),
    Beat(Beat),
}

struct SessionActor<C> {
    config: ClientConfig,
    connector: Arc<C>,
    transport: TransportSession,
    heartbeat: HeartbeatMonitor,
    log: TerminalLog,
    working_directory: String,
    link: Option<Link>,
    dialing: Option<PendingDial>,
    startup: Option<Pin<Box<Sleep>>>,
    reconnect: Option<Pin<Box<Sleep>>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LogEvent>,
}

impl<C: Connector> SessionActor<C> {
    fn new(
        config: ClientConfig,
        connector: Arc<C>,
        state_tx: watch::Sender<ConnectionState>,
        events: broadcast::Sender<LogEvent>,
    ) -> Self {
        let transport = TransportSession::new(config.reconnect_policy());
        let heartbeat =
            HeartbeatMonitor::new(config.heartbeat_interval(), config.max_missed_heartbeats);
        let startup = Some(Box::pin(tokio::time::sleep(config.startup_grace())));
        Self {
            working_directory: config.initial_directory.clone(),
            config,
            connector,
            transport,
            heartbeat,
            log: TerminalLog::new(),
            link: None,
            dialing: None,
            startup,
            reconnect: None,
            state_tx,
            events,
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        loop {
            let wake = tokio::select! {
                req = requests.recv() => Wake::Request(req),
                _ = sleep_opt(&mut self.startup) => Wake::Startup,
                _ = sleep_opt(&mut self.reconnect) => Wake::ReconnectDue,
                res = dial_opt(&mut self.dialing) => Wake::Dialed(res),
                event = recv_opt(&mut self.link) => Wake::Link(event),
                beat = self.heartbeat.tick() => Wake::Beat(beat),
            };

            match wake {
                Wake::Request(Some(Request::Submit(raw))) => self.submit(raw).await,
                Wake::Request(Some(Request::Lines(reply))) => {
                    let _ = reply.send(self.log.lines().to_vec());
                }
                Wake::Request(Some(Request::Snapshot(reply))) => {
                    let _ = reply.send(self.snapshot());
                }
                Wake::Request(Some(Request::Shutdown(reply))) => {
                    self.teardown().await;
                    let _ = reply.send(());
                    break;
                }
                Wake::Request(None) => {
                    self.teardown().await;
                    break;
                }
                Wake::Startup => {
                    self.startup = None;
                    self.apply(Input::Connect {
                        delay: Duration::ZERO,
                    })
                    .await;
                }
                Wake::ReconnectDue => {
                    self.reconnect = None;
                    self.apply(Input::ReconnectDue).await;
                }
                Wake::Dialed(Ok(link)) => {
                    self.dialing = None;
                    self.link = Some(link);
                    self.apply(Input::Opened).await;
                }
                Wake::Dialed(Err(e)) => {
                    self.dialing = None;
                    warn!(error = %e, url = %self.config.url, "connection attempt failed");
                    // Retrying cannot fix a bad URL; stop until a manual reconnect.
                    let close = if e.is_transient() {
                        CloseInfo::abnormal(e.to_string())
                    } else {
                        CloseInfo::normal(e.to_string())
                    };
                    self.apply(Input::Closed(close)).await;
                }
                Wake::Link(Some(LinkEvent::Text(text))) => self.on_text(&text),
                Wake::Link(Some(LinkEvent::Closed(close))) => {
                    self.link = None;
                    info!(code = close.code, reason = %close.reason, clean = close.was_clean, "connection closed");
                    self.apply(Input::Closed(close)).await;
                }
                Wake::Link(None) => {
                    self.link = None;
                    self.apply(Input::Closed(CloseInfo::abnormal("link dropped")))
                        .await;
                }
                Wake::Beat(Beat::Ping(ping)) => {
                    if let Some(link) = &self.link {
                        if let Err(e) = link.send(ping).await {
                            debug!(error = %e, "heartbeat not sent");
                        }
                    }
                }
                Wake::Beat(Beat::Expired { missed }) => {
                    warn!(missed, "heartbeat unacknowledged, forcing reconnect");
                    self.apply(Input::LivenessLost).await;
                }
            }
        }
        debug!("session actor stopped");
    }

    async fn apply(&mut self, input: Input) {
        let actions = self.transport.handle(input);
        for action in actions {
            self.perform(action).await;
        }
        self.state_tx.send_replace(self.transport.state());
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::ArmReconnect(delay) => {
                self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::CancelReconnect => self.reconnect = None,
            Action::Dial => {
                let connector = Arc::clone(&self.connector);
                let url = self.config.url.clone();
                debug!(url = %url, "dialing");
                let dial: PendingDial = Box::pin(async move { connector.dial(&url).await });
                self.dialing = Some(dial);
            }
            Action::CloseLink { code, reason } => {
                if let Some(link) = &self.link {
                    link.close(code, reason).await;
                }
            }
            Action::DropLink { code, reason } => {
                self.dialing = None;
                if let Some(link) = self.link.take() {
                    link.close(code, reason).await;
                }
            }
            Action::StartHeartbeat => self.heartbeat.start(),
            Action::StopHeartbeat => self.heartbeat.stop(),
            Action::Notify(notice) => self.notify(notice),
        }
    }

    fn notify(&mut self, notice: Notice) {
        match notice {
            Notice::Connected => {
                info!(url = %self.config.url, "connected");
                let line = format!("Connected to {}", self.config.url);
                self.append(LineKind::Output, line);
            }
            Notice::ReconnectScheduled {
                attempt,
                max_attempts,
                delay,
                code,
            } => {
                info!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, code, "reconnect scheduled");
                let line = format!(
                    "Connection lost (code {code}). Reconnecting in {:.1}s (attempt {attempt}/{max_attempts})",
                    delay.as_secs_f64()
                );
                self.append(LineKind::Error, line);
            }
            Notice::GaveUp { max_attempts } => {
                warn!(max_attempts, "giving up on automatic reconnection");
                let line = format!(
                    "Connection failed after {max_attempts} reconnect attempts. Type 'reconnect' to try again."
                );
                self.append(LineKind::Error, line);
            }
            Notice::ClosedNormally { code, reason } => {
                let line = if reason.is_empty() {
                    format!("Connection closed (code {code})")
                } else {
                    format!("Connection closed (code {code}): {reason}")
                };
                self.append(LineKind::Output, line);
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let msg = match crawlterm_protocol::decode::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed message from executor");
                self.append(LineKind::Error, format!("Malformed message from executor: {e}"));
                return;
            }
        };

        let heartbeat_ack = msg.is_heartbeat_ack();
        match msg {
            ServerMessage::Output { content } => self.append(LineKind::Output, content),
            ServerMessage::Error { content } => self.append(LineKind::Error, content),
            ServerMessage::DirectoryChanged { directory } => {
                debug!(directory = %directory, "working directory changed");
                self.working_directory = directory;
            }
            ServerMessage::Pong { .. } if heartbeat_ack => self.heartbeat.acknowledge(),
            ServerMessage::Pong { content } => {
                self.heartbeat.acknowledge();
                self.append(LineKind::Output, content);
            }
            ServerMessage::Ping { content } => debug!(content = %content, "executor ping"),
        }
    }

    async fn submit(&mut self, raw: String) {
        let verdict = gate::validate(&raw);
        if verdict == Verdict::Rejected(Rejection::Empty) {
            return;
        }
        self.append(LineKind::Command, raw.trim());

        match verdict {
            Verdict::LocalMeta(meta) => self.run_meta(meta).await,
            Verdict::Rejected(rejection) => {
                debug!(%rejection, "command rejected locally");
                self.append(LineKind::Error, rejection.to_string());
            }
            Verdict::Accepted(command) => self.dispatch(command).await,
        }
    }

    async fn dispatch(&mut self, command: String) {
        if self.transport.state() != ConnectionState::Open {
            self.append(LineKind::Error, "Not connected. Command not sent.");
            return;
        }
        let msg = ClientMessage::Command {
            command,
            directory: self.working_directory.clone(),
        };
        let sent = match &self.link {
            Some(link) => link.send(msg).await,
            None => Err(ClientError::transport("no link")),
        };
        if let Err(e) = sent {
            self.append(LineKind::Error, format!("Failed to send command: {e}"));
        }
    }

    async fn run_meta(&mut self, meta: MetaCommand) {
        match meta {
            MetaCommand::Clear => {
                self.log.clear();
                let _ = self.events.send(LogEvent::Cleared);
            }
            MetaCommand::Test => {
                let state = self.transport.state();
                self.append(
                    LineKind::Output,
                    format!("Connection test: state={state}, url={}", self.config.url),
                );
                let verdict = if state == ConnectionState::Open {
                    "Executor link is open"
                } else {
                    "Executor link is not open"
                };
                self.append(LineKind::Output, verdict);
            }
            MetaCommand::Ping => {
                let line = if self.heartbeat.is_active() {
                    let last = match self.heartbeat.since_last_ack() {
                        Some(elapsed) => format!("last ack {}ms ago", elapsed.as_millis()),
                        None => "no ack yet".to_string(),
                    };
                    format!(
                        "Heartbeat active every {}s: {last}, {} missed",
                        self.heartbeat.period().as_secs(),
                        self.heartbeat.missed()
                    )
                } else {
                    format!("Heartbeat inactive (state: {})", self.transport.state())
                };
                self.append(LineKind::Output, line);
            }
            MetaCommand::Debug => {
                let snapshot = self.snapshot();
                let lines = [
                    format!("state: {}", snapshot.state),
                    format!("attempt: {}/{}", snapshot.attempt, snapshot.max_attempts),
                    format!("reconnect pending: {}", snapshot.reconnect_pending),
                    format!(
                        "heartbeat: {} (sent {})",
                        if snapshot.heartbeat_active { "active" } else { "inactive" },
                        self.heartbeat.sent()
                    ),
                    format!("directory: {}", display_dir(&snapshot.working_directory)),
                    format!("lines: {}", snapshot.line_count),
                ];
                for line in lines {
                    self.append(LineKind::Output, line);
                }
            }
            MetaCommand::Reconnect => {
                self.append(LineKind::Output, "Reconnecting...");
                self.apply(Input::ManualReconnect).await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.startup = None;
        self.apply(Input::Disconnect).await;

        if self.transport.state() == ConnectionState::Closing {
            let close = match self.link.as_mut() {
                Some(link) => tokio::time::timeout(CLOSE_TIMEOUT, wait_closed(link))
                    .await
                    .unwrap_or_else(|_| CloseInfo::normal("close timed out")),
                None => CloseInfo::normal("client disconnect"),
            };
            self.link = None;
            self.apply(Input::Closed(close)).await;
        }

        self.link = None;
        self.dialing = None;
        self.reconnect = None;
        self.heartbeat.stop();
        self.state_tx.send_replace(self.transport.state());
        info!("session disconnected");
    }

    fn snapshot(&self) -> SessionSnapshot {
        let policy = self.transport.policy();
        SessionSnapshot {
            state: self.transport.state(),
            attempt: policy.attempt,
            max_attempts: policy.max_attempts,
            reconnect_pending: self.transport.reconnect_pending(),
            heartbeat_active: self.heartbeat.is_active(),
            working_directory: self.working_directory.clone(),
            line_count: self.log.len(),
        }
    }

    fn append(&mut self, kind: LineKind, content: impl Into<String>) {
        let line = self.log.append(kind, content);
        // No subscribers is fine; the log keeps the line.
        let _ = self.events.send(LogEvent::Appended(line));
    }
}

/// Working directory as shown to the operator; empty means the executor root.
pub fn display_dir(dir: &str) -> &str {
    if dir.is_empty() { "~" } else { dir }
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn dial_opt(dialing: &mut Option<PendingDial>) -> ClientResult<Link> {
    match dialing {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt(link: &mut Option<Link>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_closed(link: &mut Link) -> CloseInfo {
    loop {
        match link.recv().await {
            Some(LinkEvent::Closed(close)) => return close,
            Some(LinkEvent::Text(_)) => continue,
            None => return CloseInfo::normal("link finished"),
        }
    }
}
