//! Type definitions for the proxy forwarder.

use crate::protocol::ProtocolError;
use bytes::Bytes;
use hyper::Uri;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Downstream peer a proxying imposter forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Plain TCP endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "tcp".to_string(),
            host: host.into(),
            port,
        }
    }

    /// Parse a proxy URL such as `tcp://localhost:3000` or `https://api.example.com`.
    ///
    /// `http` and `https` fall back to their well-known ports; every other
    /// scheme must carry an explicit port.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| EndpointError::InvalidUrl(url.to_string(), format!("{e}")))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| EndpointError::InvalidUrl(url.to_string(), "missing scheme".into()))?
            .to_ascii_lowercase();

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointError::MissingHost(url.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let port = match (uri.port_u16(), scheme.as_str()) {
            (Some(port), _) => port,
            (None, "http") => 80,
            (None, "https") => 443,
            (None, _) => return Err(EndpointError::MissingPort(url.to_string())),
        };

        Ok(Self { scheme, host, port })
    }

    /// Whether the connection to this endpoint is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Errors produced while parsing a proxy URL
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("Invalid proxy URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("Proxy URL '{0}' has no host")]
    MissingHost(String),
    #[error("Proxy URL '{0}' has no port")]
    MissingPort(String),
}

/// Reply collected from a downstream peer.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub data: Bytes,
    pub elapsed: Duration,
}

/// Failure of a single forward.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// DNS resolution of the target failed or returned no addresses.
    #[error("Cannot resolve {target}")]
    UnresolvableTarget { target: Endpoint },
    /// Every resolved address actively refused the connection.
    #[error("Unable to connect to {target}")]
    ConnectionRefused { target: Endpoint },
    /// Any other socket-level failure, passed through unclassified.
    #[error("Transport error with {target}: {source}")]
    Transport {
        target: Endpoint,
        #[source]
        source: std::io::Error,
    },
    /// The imposter's protocol could not produce an outbound request.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ProxyError {
    pub(crate) fn transport(target: &Endpoint, source: std::io::Error) -> Self {
        ProxyError::Transport {
            target: target.clone(),
            source,
        }
    }

    /// Mountebank error code surfaced in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::UnresolvableTarget { .. } | ProxyError::ConnectionRefused { .. } => {
                "invalid proxy"
            }
            ProxyError::Transport { .. } => "proxy transport error",
            ProxyError::Protocol(_) => "bad data",
        }
    }
}
