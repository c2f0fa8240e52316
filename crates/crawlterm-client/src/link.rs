//! Physical connections.
//!
//! A [`Link`] is one live connection seen as two channels: frames going out
//! and [`LinkEvent`]s coming in. The last inbound event of a link is always
//! `Closed`, unless the link was dropped by the client first.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crawlterm_protocol::{CLOSE_NORMAL, ClientMessage, ServerMessage};

use crate::error::{ClientError, ClientResult};
use crate::transport::CloseInfo;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;

/// Status code reported for a close frame without one.
const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ClientMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Closed(CloseInfo),
}

#[derive(Debug)]
pub struct Link {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<LinkEvent>,
}

impl Link {
    pub fn new(outbound: mpsc::Sender<Outbound>, inbound: mpsc::Receiver<LinkEvent>) -> Self {
        Self { outbound, inbound }
    }

    /// In-memory link with its far end.
    pub fn pair() -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        (
            Link::new(out_tx, in_rx),
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    pub async fn send(&self, msg: ClientMessage) -> ClientResult<()> {
        self.outbound
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| ClientError::transport("link closed"))
    }

    pub async fn close(&self, code: u16, reason: impl Into<String>) {
        let frame = Outbound::Close {
            code,
            reason: reason.into(),
        };
        if self.outbound.send(frame).await.is_err() {
            debug!(code, "close on an already finished link");
        }
    }

    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.inbound.recv().await
    }
}

/// The executor-facing end of an in-memory [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    pub outbound: mpsc::Receiver<Outbound>,
    pub inbound: mpsc::Sender<LinkEvent>,
}

impl LinkPeer {
    pub async fn send(&self, msg: &ServerMessage) -> ClientResult<()> {
        let text = crawlterm_protocol::encode(msg)?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> ClientResult<()> {
        self.inbound
            .send(LinkEvent::Text(text.into()))
            .await
            .map_err(|_| ClientError::transport("client dropped link"))
    }

    pub async fn close(&self, code: u16, reason: &str, was_clean: bool) -> ClientResult<()> {
        let info = CloseInfo {
            code,
            reason: reason.to_string(),
            was_clean,
        };
        self.inbound
            .send(LinkEvent::Closed(info))
            .await
            .map_err(|_| ClientError::transport("client dropped link"))
    }

    /// Next frame the client sent, or `None` once the client dropped the link.
    pub async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }
}

/// Opens physical connections to the executor.
pub trait Connector: Send + Sync + 'static {
    fn dial(&self, url: &str) -> impl Future<Output = ClientResult<Link>> + Send;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn dial(&self, url: &str) -> ClientResult<Link> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| match e {
                WsError::Url(_) | WsError::HttpFormat(_) => ClientError::Config {
                    message: format!("invalid executor url {url}: {e}"),
                },
                e => ClientError::transport(format!("failed to connect to {url}: {e}")),
            })?;
        debug!(url, "websocket connected");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(pump(ws, out_rx, in_tx));
        Ok(Link::new(out_tx, in_rx))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bridge a websocket to the link channels until either side goes away.
async fn pump(ws: WsStream, mut outbound: mpsc::Receiver<Outbound>, inbound: mpsc::Sender<LinkEvent>) {
    let (mut sink, mut stream) = ws.split();

    let info = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Message(msg)) => {
                    let text = match crawlterm_protocol::encode(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "dropping unencodable message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(text)).await {
                        break CloseInfo::abnormal(format!("write failed: {e}"));
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    // The peer's echo arrives on the stream branch.
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        break CloseInfo::abnormal(format!("close failed: {e}"));
                    }
                }
                None => {
                    let frame = CloseFrame {
                        code: CloseCode::from(CLOSE_NORMAL),
                        reason: "link dropped".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(LinkEvent::Text(text.as_str().to_owned())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseInfo {
                            code: u16::from(frame.code),
                            reason: frame.reason.as_str().to_owned(),
                            was_clean: true,
                        },
                        None => CloseInfo {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                            was_clean: true,
                        },
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseInfo::abnormal(e.to_string()),
                None => break CloseInfo::abnormal("connection reset"),
            },
        }
    };

    debug!(code = info.code, clean = info.was_clean, "websocket closed");
    let _ = inbound.send(LinkEvent::Closed(info)).await;
}
