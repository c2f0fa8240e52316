//! Operator side of the crawlterm command channel.
//!
//! [`SessionClient`] keeps one logical session alive across physical
//! reconnects, gates commands against the allow-list before they reach the
//! wire, and exposes everything the operator should see as an ordered log of
//! [`TerminalLine`]s.

pub mod config;
pub mod error;
pub mod gate;
pub mod heartbeat;
pub mod link;
pub mod log;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use gate::{MetaCommand, Rejection, Verdict};
pub use link::{Connector, Link, LinkEvent, LinkPeer, Outbound, WsConnector};
pub use log::{LineKind, LogEvent, TerminalLine};
pub use session::{SessionClient, SessionSnapshot, display_dir};
pub use transport::{CloseInfo, ConnectionState, ReconnectPolicy};
