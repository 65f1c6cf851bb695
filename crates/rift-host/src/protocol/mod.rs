//! Protocol capability sets.
//!
//! Every protocol an imposter can speak (`tcp`, `http`, `https`, `smtp`, and
//! operator-supplied ones) implements the same two traits:
//! - `WireFormat`: how a request is parsed from and formatted to the wire,
//!   plus a framing hint used by the forwarder
//! - `Protocol`: how a listener is started for an imposter
//!
//! The `ProtocolRegistry` maps protocol names to these implementations.
//!
//! ## Module Structure
//!
//! - `registry`: registry assembly and lookup
//! - `custom`: protofile loading and out-of-process protocols
//! - `tcp`, `http`, `smtp`: built-in protocols

pub mod custom;
pub mod http;
pub mod registry;
pub mod smtp;
pub mod tcp;

use crate::imposter::{ImposterConfig, ImposterError, RequestLog};
use crate::lifecycle::{ConnectionManager, LifecycleError};
use crate::proxy::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

pub use registry::{builtin_protocols, ProtocolMap, ProtocolRegistry};

// ============================================================================
// Captured requests
// ============================================================================

/// A request received by an imposter, in Mountebank's introspection shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub request_from: String,
    #[serde(flatten)]
    pub body: RequestBody,
    pub timestamp: String,
}

impl CapturedRequest {
    pub fn new(request_from: impl Into<String>, body: RequestBody) -> Self {
        Self {
            request_from: request_from.into(),
            body,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Protocol-specific part of a captured request
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestBody {
    Tcp(TcpRequest),
    Http(HttpRequest),
    Smtp(SmtpRequest),
    Custom(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpRequest {
    /// UTF-8 text, or base64 when the imposter runs in binary mode
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpRequest {
    pub envelope_from: String,
    pub envelope_to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub text: String,
}

/// Errors raised by wire formats
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Protocol '{0}' does not support proxying")]
    ProxyUnsupported(String),
    #[error("Invalid encoding: {0}")]
    Encoding(String),
}

// ============================================================================
// Capability traits
// ============================================================================

/// Wire-level behaviour of a protocol.
pub trait WireFormat: Send + Sync + 'static {
    /// Bytes sent to a downstream peer when proxying `request` to `target`.
    fn format_request(
        &self,
        request: &CapturedRequest,
        target: &Endpoint,
    ) -> Result<Bytes, ProtocolError>;

    /// Parse one inbound request received from `request_from`.
    fn parse_request(&self, raw: &[u8], request_from: &str)
        -> Result<CapturedRequest, ProtocolError>;

    /// Whether `received` already holds a complete downstream reply.
    fn response_complete(&self, _received: &[u8]) -> bool {
        false
    }
}

/// A protocol that can run imposters.
#[async_trait]
pub trait Protocol: WireFormat {
    /// Start serving `config` and return the handle that stops it.
    async fn start(
        &self,
        config: &ImposterConfig,
        context: ImposterContext,
    ) -> Result<Box<dyn ImposterServer>, ImposterError>;
}

/// Running listener (or process) behind an imposter.
#[async_trait]
pub trait ImposterServer: Send + Sync {
    fn port(&self) -> u16;

    async fn stop(&self) -> Result<(), LifecycleError>;
}

/// Host-provided services handed to a protocol when an imposter starts.
#[derive(Clone)]
pub struct ImposterContext {
    pub requests: Arc<RequestLog>,
    /// `_requests` callback URL with a `:port` placeholder
    pub callback_url_template: String,
}

// ============================================================================
// Listener helpers shared by the built-in protocols
// ============================================================================

/// Bind the imposter's listener; port `0` or no port lets the OS choose.
pub async fn bind_listener(config: &ImposterConfig) -> Result<TcpListener, ImposterError> {
    let host = config.host.as_deref().unwrap_or("0.0.0.0");
    let port = config.port.unwrap_or(0);
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| ImposterError::BindError(port, e.to_string()))?;
    let bound = listener
        .local_addr()
        .map_err(|e| ImposterError::BindError(port, e.to_string()))?;
    info!("Imposter bound to {}", bound);
    Ok(listener)
}

/// Built-in imposter server: a listener owned by a connection manager.
pub struct ListenerServer {
    port: u16,
    connections: Arc<ConnectionManager>,
}

impl ListenerServer {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            port: connections.local_addr().port(),
            connections,
        }
    }
}

#[async_trait]
impl ImposterServer for ListenerServer {
    fn port(&self) -> u16 {
        self.port
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        self.connections.shutdown().await
    }
}
