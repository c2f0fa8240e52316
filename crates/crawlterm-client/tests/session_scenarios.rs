use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};

use crawlterm_client::{
    ClientConfig, ClientError, ClientResult, ConnectionState, Connector, LineKind, Link, LinkPeer,
    LogEvent, Outbound, SessionClient, SessionSnapshot, TerminalLine,
};
use crawlterm_protocol::{ClientMessage, ServerMessage};

/// In-memory transport: every successful dial hands its far end to the test.
#[derive(Clone)]
struct MockConnector {
    peers: mpsc::UnboundedSender<LinkPeer>,
    dials: Arc<Mutex<Vec<Instant>>>,
    refusals: Arc<AtomicUsize>,
}

impl MockConnector {
    fn new() -> (Self, mpsc::UnboundedReceiver<LinkPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            dials: Arc::new(Mutex::new(Vec::new())),
            refusals: Arc::new(AtomicUsize::new(0)),
        };
        (connector, rx)
    }

    fn refuse_next(&self, n: usize) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }

    fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }
}

impl Connector for MockConnector {
    async fn dial(&self, _url: &str) -> ClientResult<Link> {
        self.dials.lock().unwrap().push(Instant::now());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::transport("connection refused"));
        }
        let (link, peer) = Link::pair();
        self.peers
            .send(peer)
            .map_err(|_| ClientError::transport("test harness gone"))?;
        Ok(link)
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        url: "ws://mock/ws/terminal".to_string(),
        ..ClientConfig::default()
    }
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<LinkPeer>) -> LinkPeer {
    timeout(Duration::from_secs(120), peers.recv())
        .await
        .expect("no dial within 120s")
        .expect("connector dropped")
}

async fn next_frame(peer: &mut LinkPeer) -> Outbound {
    timeout(Duration::from_secs(60), peer.next())
        .await
        .expect("no frame within 60s")
        .expect("link dropped")
}

async fn wait_for_line(
    events: &mut broadcast::Receiver<LogEvent>,
    pred: impl Fn(&TerminalLine) -> bool,
) -> TerminalLine {
    timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(LogEvent::Appended(line)) if pred(&line) => return line,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("line never appeared")
}

async fn wait_for_state(client: &SessionClient, state: ConnectionState) {
    let mut rx = client.watch_state();
    timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
        .await
        .expect("state never reached")
        .expect("session gone");
}

async fn wait_for_snapshot(
    client: &SessionClient,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    for _ in 0..1000 {
        let snapshot = client.snapshot().await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("snapshot condition never held");
}

fn count_kind(lines: &[TerminalLine], kind: LineKind) -> usize {
    lines.iter().filter(|l| l.kind == kind).count()
}

fn drain_frames(peer: &mut LinkPeer) -> Vec<Outbound> {
    let mut frames = Vec::new();
    while let Ok(frame) = peer.outbound.try_recv() {
        frames.push(frame);
    }
    frames
}

fn is_heartbeat(frame: &Outbound) -> bool {
    matches!(
        frame,
        Outbound::Message(ClientMessage::Ping {
            heartbeat: true,
            ..
        })
    )
}

#[tokio::test(start_paused = true)]
async fn first_dial_waits_for_startup_grace() {
    let (connector, mut peers) = MockConnector::new();
    let started = Instant::now();
    let client = SessionClient::spawn(config(), connector.clone());

    let _peer = next_peer(&mut peers).await;
    assert_eq!(connector.dial_times()[0] - started, Duration::from_millis(500));
    wait_for_state(&client, ConnectionState::Open).await;

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn allowed_command_round_trip() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut events = client.subscribe();
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    client.submit("ls").await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Outbound::Message(ClientMessage::Command {
            command: "ls".to_string(),
            directory: String::new(),
        })
    );

    peer.send(&ServerMessage::output("file1.txt")).await.unwrap();
    let line = wait_for_line(&mut events, |l| l.kind == LineKind::Output && l.content == "file1.txt").await;
    assert_eq!(line.content, "file1.txt");

    let lines = client.lines().await.unwrap();
    let tail: Vec<(LineKind, &str)> = lines
        .iter()
        .rev()
        .take(2)
        .rev()
        .map(|l| (l.kind, l.content.as_str()))
        .collect();
    assert_eq!(
        tail,
        vec![(LineKind::Command, "ls"), (LineKind::Output, "file1.txt")]
    );

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disallowed_command_never_reaches_the_wire() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let before = client.lines().await.unwrap();

    for raw in ["rm -rf /", "bash", "python -c 'x'", "ping example.com", "LS"] {
        client.submit(raw).await.unwrap();
    }
    let lines = client.lines().await.unwrap();
    let added = &lines[before.len()..];

    assert_eq!(count_kind(added, LineKind::Command), 5);
    assert_eq!(count_kind(added, LineKind::Error), 5);
    assert!(
        added
            .iter()
            .any(|l| l.kind == LineKind::Error && l.content.starts_with("rm not allowed. Available: "))
    );
    assert!(drain_frames(&mut peer).is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn blank_input_leaves_no_trace() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let before = client.lines().await.unwrap().len();

    client.submit("   ").await.unwrap();
    client.submit("").await.unwrap();

    assert_eq!(client.lines().await.unwrap().len(), before);
    assert!(drain_frames(&mut peer).is_empty());
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn clear_empties_log_in_any_state() {
    let (connector, mut peers) = MockConnector::new();
    connector.refuse_next(usize::MAX);
    let client = SessionClient::spawn(config(), connector.clone());

    client.submit("ls").await.unwrap();
    assert!(!client.lines().await.unwrap().is_empty());
    client.submit("clear").await.unwrap();
    assert!(client.lines().await.unwrap().is_empty());

    connector.refuse_next(0);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    client.submit("debug").await.unwrap();
    assert!(!client.lines().await.unwrap().is_empty());
    client.submit("clear").await.unwrap();
    assert!(client.lines().await.unwrap().is_empty());
    assert!(drain_frames(&mut peer).is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn commands_while_disconnected_report_not_connected() {
    let (connector, _peers) = MockConnector::new();
    connector.refuse_next(usize::MAX);
    let client = SessionClient::spawn(config(), connector);

    client.submit("pwd").await.unwrap();
    let lines = client.lines().await.unwrap();
    let at = lines
        .iter()
        .position(|l| l.kind == LineKind::Command && l.content == "pwd")
        .expect("command line missing");
    assert_eq!(lines[at + 1].kind, LineKind::Error);
    assert!(lines[at + 1].content.contains("Not connected"));

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn meta_commands_answer_locally() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let before = client.lines().await.unwrap().len();

    client.submit("test").await.unwrap();
    client.submit("ping").await.unwrap();
    client.submit("debug").await.unwrap();

    let lines = client.lines().await.unwrap();
    let added = &lines[before..];
    assert!(added.iter().any(|l| l.content.contains("state=open")));
    assert!(added.iter().any(|l| l.content.starts_with("Heartbeat active every 30s")));
    assert!(added.iter().any(|l| l.content == "attempt: 0/5"));
    assert_eq!(count_kind(added, LineKind::Error), 0);
    assert!(drain_frames(&mut peer).is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_backs_off_exponentially() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    let peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    // Second attempt is refused, third succeeds.
    connector.refuse_next(1);
    peer.close(1006, "", false).await.unwrap();
    let _third = next_peer(&mut peers).await;

    let dials = connector.dial_times();
    assert_eq!(dials.len(), 3);
    assert_eq!(dials[1] - dials[0], Duration::from_millis(1000));
    assert_eq!(dials[2] - dials[1], Duration::from_millis(2000));

    wait_for_state(&client, ConnectionState::Open).await;
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.attempt, 0);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts_until_manual_reconnect() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    let mut events = client.subscribe();
    let peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    connector.refuse_next(usize::MAX);
    peer.close(1006, "", false).await.unwrap();
    wait_for_line(&mut events, |l| {
        l.kind == LineKind::Error && l.content.contains("Type 'reconnect'")
    })
    .await;

    let dials = connector.dial_times();
    assert_eq!(dials.len(), 6);
    let gaps: Vec<u64> = dials
        .windows(2)
        .skip(1)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![2000, 4000, 8000, 16000]);

    sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.dial_count(), 6);
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert!(!snapshot.reconnect_pending);
    assert_eq!(snapshot.attempt, 5);

    connector.refuse_next(0);
    let asked = Instant::now();
    client.submit("reconnect").await.unwrap();
    let _peer = next_peer(&mut peers).await;
    assert_eq!(connector.dial_times()[6], asked);
    wait_for_state(&client, ConnectionState::Open).await;
    assert_eq!(client.snapshot().await.unwrap().attempt, 0);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    let mut events = client.subscribe();
    let peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    peer.close(1000, "executor restart", true).await.unwrap();
    wait_for_line(&mut events, |l| l.content.starts_with("Connection closed (code 1000)")).await;

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert!(!snapshot.reconnect_pending);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.dial_count(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_runs_only_while_open() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    sleep(Duration::from_secs(95)).await;
    let frames = drain_frames(&mut peer);
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(is_heartbeat));

    peer.close(1000, "", true).await.unwrap();
    wait_for_state(&client, ConnectionState::Closed).await;
    sleep(Duration::from_secs(300)).await;

    assert!(drain_frames(&mut peer).is_empty());
    assert_eq!(connector.dial_count(), 1);
    assert!(!client.snapshot().await.unwrap().heartbeat_active);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_ack_is_silent() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let before = client.lines().await.unwrap().len();

    let frame = next_frame(&mut peer).await;
    assert!(is_heartbeat(&frame));
    peer.send(&ServerMessage::pong(true)).await.unwrap();

    sleep(Duration::from_millis(10)).await;
    assert_eq!(client.lines().await.unwrap().len(), before);

    client.submit("ping").await.unwrap();
    let lines = client.lines().await.unwrap();
    let report = lines.last().expect("ping report");
    assert!(report.content.contains("last ack"), "{}", report.content);
    assert!(report.content.ends_with("0 missed"));

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn strict_heartbeat_forces_reconnect() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(
        ClientConfig {
            max_missed_heartbeats: Some(2),
            ..config()
        },
        connector.clone(),
    );
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let opened = Instant::now();

    let _second = next_peer(&mut peers).await;
    let frames = drain_frames(&mut peer);
    assert_eq!(frames.iter().filter(|f| is_heartbeat(f)).count(), 2);
    assert!(frames.contains(&Outbound::Close {
        code: 4000,
        reason: "heartbeat timeout".to_string()
    }));
    assert_eq!(connector.dial_times()[1] - opened, Duration::from_secs(91));

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn directory_follows_executor_acknowledgment_only() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    client.submit("cd /tmp").await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Outbound::Message(ClientMessage::Command {
            command: "cd /tmp".to_string(),
            directory: String::new(),
        })
    );
    assert_eq!(client.snapshot().await.unwrap().working_directory, "");

    peer.send(&ServerMessage::DirectoryChanged {
        directory: "/home/user/projects".to_string(),
    })
    .await
    .unwrap();
    wait_for_snapshot(&client, |s| s.working_directory == "/home/user/projects").await;

    client.submit("scrapy list").await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Outbound::Message(ClientMessage::Command {
            command: "scrapy list".to_string(),
            directory: "/home/user/projects".to_string(),
        })
    );

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn directory_survives_reconnect() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    peer.send(&ServerMessage::DirectoryChanged {
        directory: "/srv/crawlers".to_string(),
    })
    .await
    .unwrap();
    wait_for_snapshot(&client, |s| s.working_directory == "/srv/crawlers").await;

    peer.close(1006, "", false).await.unwrap();
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    client.submit("ls").await.unwrap();
    assert_eq!(
        next_frame(&mut peer).await,
        Outbound::Message(ClientMessage::Command {
            command: "ls".to_string(),
            directory: "/srv/crawlers".to_string(),
        })
    );

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_reported_and_link_stays_open() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut events = client.subscribe();
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    peer.send_text("{not json").await.unwrap();
    let line = wait_for_line(&mut events, |l| l.kind == LineKind::Error).await;
    assert!(line.content.starts_with("Malformed message from executor"));
    assert_eq!(client.state(), ConnectionState::Open);

    client.submit("pwd").await.unwrap();
    assert!(matches!(
        next_frame(&mut peer).await,
        Outbound::Message(ClientMessage::Command { .. })
    ));

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn executor_errors_become_error_lines() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector);
    let mut events = client.subscribe();
    let peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;

    peer.send(&ServerMessage::error("scrapy exited with status 1"))
        .await
        .unwrap();
    let line = wait_for_line(&mut events, |l| l.kind == LineKind::Error).await;
    assert_eq!(line.content, "scrapy exited with status 1");
    assert_eq!(client.state(), ConnectionState::Open);

    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_normally() {
    let (connector, mut peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    let mut peer = next_peer(&mut peers).await;
    wait_for_state(&client, ConnectionState::Open).await;
    let state = client.watch_state();

    let closer = tokio::spawn(async move {
        let frame = peer.next().await;
        let _ = peer.close(1000, "", true).await;
        frame
    });
    client.shutdown().await.unwrap();

    assert_eq!(
        closer.await.unwrap(),
        Some(Outbound::Close {
            code: 1000,
            reason: "client disconnect".to_string()
        })
    );
    assert_eq!(*state.borrow(), ConnectionState::Closed);
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_reconnect() {
    let (connector, _peers) = MockConnector::new();
    connector.refuse_next(usize::MAX);
    let client = SessionClient::spawn(config(), connector.clone());

    // Startup dial at 500ms fails, reconnect armed for 1500ms.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(connector.dial_count(), 1);
    assert!(client.snapshot().await.unwrap().reconnect_pending);

    client.shutdown().await.unwrap();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_before_startup_never_dials() {
    let (connector, _peers) = MockConnector::new();
    let client = SessionClient::spawn(config(), connector.clone());
    client.shutdown().await.unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.dial_count(), 0);
}

/// Connector whose every dial fails with a configuration error.
struct MisconfiguredConnector {
    dials: Arc<AtomicUsize>,
}

impl Connector for MisconfiguredConnector {
    async fn dial(&self, url: &str) -> ClientResult<Link> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::Config {
            message: format!("invalid executor url {url}"),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn misconfigured_url_does_not_back_off() {
    let dials = Arc::new(AtomicUsize::new(0));
    let connector = MisconfiguredConnector {
        dials: Arc::clone(&dials),
    };
    let client = SessionClient::spawn(config(), connector);
    let mut events = client.subscribe();

    let line = wait_for_line(&mut events, |l| l.content.contains("invalid executor url")).await;
    assert_eq!(line.kind, LineKind::Output);
    assert!(line.content.starts_with("Connection closed (code 1000)"));

    sleep(Duration::from_secs(120)).await;
    assert_eq!(dials.load(Ordering::SeqCst), 1);
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert!(!snapshot.reconnect_pending);
    assert_eq!(snapshot.attempt, 0);

    client.submit("reconnect").await.unwrap();
    wait_for_snapshot(&client, |_| dials.load(Ordering::SeqCst) == 2).await;

    client.shutdown().await.unwrap();
}
