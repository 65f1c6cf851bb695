//! Outbound proxying for imposters.
//!
//! This module provides the one-shot forwarder used by proxying imposters:
//! - `Endpoint`: the downstream peer (`tcp://`, `http://`, `https://` URLs)
//! - `Forwarder`: opens a fresh connection per request, writes the formatted
//!   request, half-closes, and collects the reply
//! - `ProxyError`: typed failures (unresolvable, refused, transport)
//!
//! # Module Structure
//!
//! - `types` - Endpoint, ProxyResponse and ProxyError
//! - `forwarder` - Forwarder and its configuration
//! - `tls` - rustls client/server helpers

mod forwarder;
mod tls;
mod types;

pub use forwarder::{Forwarder, ForwarderConfig};
pub use tls::{client_connector, create_tls_acceptor};
pub use types::{Endpoint, EndpointError, ProxyError, ProxyResponse};
