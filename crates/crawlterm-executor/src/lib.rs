//! Host side of the crawlterm command channel: a websocket endpoint that
//! re-checks every command against the allow-list, runs it in the directory
//! the client supplies, and streams the output back line by line.

pub mod config;
pub mod connection;
pub mod error;
pub mod exec;
pub mod server;

pub use config::ExecutorConfig;
pub use error::{ExecError, ExecResult};
pub use exec::Executor;
pub use server::{router, run, serve};
