//! Type definitions for Mountebank-compatible imposter management.
//!
//! This module contains the imposter configuration, the response plan derived
//! from it, and the imposter error type.

use crate::lifecycle::LifecycleError;
use crate::protocol::tcp::TcpMode;
use crate::proxy::Endpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Stub Types
// ============================================================================

/// Stub definition. Predicates and responses are kept as raw JSON so a
/// configuration round-trips unchanged through the admin API.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stub {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub predicates: Vec<Value>,
    #[serde(default)]
    pub responses: Vec<Value>,
}

// ============================================================================
// Imposter Configuration
// ============================================================================

fn default_protocol() -> String {
    "http".to_string()
}

/// Configuration for creating an imposter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImposterConfig {
    /// Port for the imposter. Absent or `0` lets the OS pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Host/IP address to bind the imposter to. Defaults to "0.0.0.0" (all interfaces).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub record_requests: bool,
    /// TCP payload encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TcpMode>,
    /// PEM private key (https)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// PEM certificate chain (https)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default)]
    pub stubs: Vec<Stub>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_response: Option<Value>,
}

impl Default for ImposterConfig {
    fn default() -> Self {
        Self {
            port: None,
            protocol: default_protocol(),
            name: None,
            host: None,
            record_requests: false,
            mode: None,
            key: None,
            cert: None,
            stubs: Vec::new(),
            default_response: None,
        }
    }
}

/// How a built-in imposter answers every request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePlan {
    /// Forward to a downstream peer.
    Proxy(Endpoint),
    /// Canned `is` response.
    Is(Value),
    /// No usable stub: `defaultResponse`, or the protocol's own default.
    Default(Option<Value>),
}

impl ImposterConfig {
    pub fn tcp_mode(&self) -> TcpMode {
        self.mode.unwrap_or_default()
    }

    /// Select the response used for every request.
    ///
    /// Predicate evaluation is not supported, so only a stub without
    /// predicates can be selected; its first response wins.
    pub fn response_plan(&self) -> Result<ResponsePlan, ImposterError> {
        let response = self
            .stubs
            .iter()
            .filter(|stub| stub.predicates.is_empty())
            .find_map(|stub| stub.responses.first());

        if let Some(response) = response {
            if let Some(proxy) = response.get("proxy") {
                let to = proxy.get("to").and_then(Value::as_str).ok_or_else(|| {
                    ImposterError::InvalidConfig("proxy response requires a 'to' URL".into())
                })?;
                let endpoint = Endpoint::parse(to)
                    .map_err(|e| ImposterError::InvalidConfig(e.to_string()))?;
                return Ok(ResponsePlan::Proxy(endpoint));
            }
            if let Some(is) = response.get("is") {
                return Ok(ResponsePlan::Is(is.clone()));
            }
        }

        Ok(ResponsePlan::Default(self.default_response.clone()))
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Imposter management errors
#[derive(Debug, Error)]
pub enum ImposterError {
    #[error("Port {0} is already in use")]
    PortInUse(u16),
    #[error("Imposter not found on port {0}")]
    NotFound(u16),
    #[error("Failed to bind port {0}: {1}")]
    BindError(u16, String),
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("Invalid imposter configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to start imposter: {0}")]
    Start(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ImposterError {
    /// Mountebank error code for admin API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ImposterError::PortInUse(_) | ImposterError::BindError(..) => "resource conflict",
            ImposterError::NotFound(_) => "no such resource",
            ImposterError::InvalidProtocol(_) | ImposterError::InvalidConfig(_) => "bad data",
            ImposterError::Start(_) | ImposterError::Lifecycle(_) => "internal error",
        }
    }
}
