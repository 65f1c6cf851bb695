//! Connection lifecycle management for every accepting listener.
//!
//! A `ConnectionManager` owns one listener and:
//! - admits or rejects each connection against an `AllowList` at accept time
//! - tracks every admitted connection in a registry keyed by `ip:port`
//! - on shutdown, stops accepting and force-closes everything still open
//!
//! The admin API and every built-in imposter run behind one of these.

mod allow_list;
mod manager;

use std::net::SocketAddr;
use thiserror::Error;

pub use allow_list::{AllowList, LOOPBACK_ADDRESSES};
pub use manager::{ConnectionGuard, ConnectionHandler, ConnectionManager};

/// Errors raised while stopping a listener
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// The accept task did not exit cleanly; the process cannot guarantee a clean exit.
    #[error("Listener on {addr} failed to close: {reason}")]
    ListenerFailed { addr: SocketAddr, reason: String },
    #[error("Failed to stop imposter on port {port}: {reason}")]
    StopFailed { port: u16, reason: String },
}

/// Registry identity of a remote peer.
pub fn socket_name(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}
