//! Raw TCP imposters.
//!
//! Every read event on a connection is treated as one request. The payload
//! is recorded as text or base64 depending on the imposter's `mode`.

use super::{
    bind_listener, CapturedRequest, ImposterContext, ImposterServer, ListenerServer, Protocol,
    ProtocolError, RequestBody, TcpRequest, WireFormat,
};
use crate::imposter::{ImposterConfig, ImposterError, RequestLog, ResponsePlan};
use crate::lifecycle::{socket_name, AllowList, ConnectionHandler, ConnectionManager};
use crate::proxy::{Endpoint, Forwarder, ForwarderConfig};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

const READ_BUFFER: usize = 8 * 1024;

/// Payload encoding of a TCP imposter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpMode {
    #[default]
    Text,
    Binary,
}

impl TcpMode {
    pub fn encode(self, raw: &[u8]) -> String {
        match self {
            TcpMode::Text => String::from_utf8_lossy(raw).into_owned(),
            TcpMode::Binary => STANDARD.encode(raw),
        }
    }

    pub fn decode(self, data: &str) -> Result<Vec<u8>, ProtocolError> {
        match self {
            TcpMode::Text => Ok(data.as_bytes().to_vec()),
            TcpMode::Binary => STANDARD
                .decode(data)
                .map_err(|e| ProtocolError::Encoding(format!("invalid base64 payload: {e}"))),
        }
    }
}

/// TCP wire format for one encoding mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpWire {
    pub mode: TcpMode,
}

impl WireFormat for TcpWire {
    fn format_request(
        &self,
        request: &CapturedRequest,
        _target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        match &request.body {
            RequestBody::Tcp(tcp) => Ok(Bytes::from(self.mode.decode(&tcp.data)?)),
            _ => Err(ProtocolError::Malformed(
                "tcp proxy requires a tcp request".into(),
            )),
        }
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        Ok(CapturedRequest::new(
            request_from,
            RequestBody::Tcp(TcpRequest {
                data: self.mode.encode(raw),
            }),
        ))
    }
}

/// The built-in `tcp` protocol.
pub struct TcpProtocol {
    forwarder: ForwarderConfig,
}

impl TcpProtocol {
    pub fn new(forwarder: ForwarderConfig) -> Self {
        Self { forwarder }
    }
}

impl WireFormat for TcpProtocol {
    fn format_request(
        &self,
        request: &CapturedRequest,
        target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        TcpWire::default().format_request(request, target)
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        TcpWire::default().parse_request(raw, request_from)
    }
}

#[async_trait]
impl Protocol for TcpProtocol {
    async fn start(
        &self,
        config: &ImposterConfig,
        context: ImposterContext,
    ) -> Result<Box<dyn ImposterServer>, ImposterError> {
        let wire = TcpWire {
            mode: config.tcp_mode(),
        };
        let reply = TcpReply::from_plan(config.response_plan()?, wire.mode)?;
        let listener = bind_listener(config).await?;

        let handler = Arc::new(TcpHandler {
            wire,
            reply,
            forwarder: Forwarder::new(wire, self.forwarder),
            requests: context.requests,
        });
        let connections = ConnectionManager::start(listener, AllowList::any(), handler)
            .map_err(|e| ImposterError::Start(e.to_string()))?;

        Ok(Box::new(ListenerServer::new(connections)))
    }
}

enum TcpReply {
    Proxy(Endpoint),
    Data(Bytes),
    Silent,
}

impl TcpReply {
    fn from_plan(plan: ResponsePlan, mode: TcpMode) -> Result<Self, ImposterError> {
        let response = match plan {
            ResponsePlan::Proxy(target) => return Ok(TcpReply::Proxy(target)),
            ResponsePlan::Is(response) | ResponsePlan::Default(Some(response)) => response,
            ResponsePlan::Default(None) => return Ok(TcpReply::Silent),
        };

        match response.get("data").and_then(Value::as_str) {
            Some(data) => {
                let bytes = mode
                    .decode(data)
                    .map_err(|e| ImposterError::InvalidConfig(e.to_string()))?;
                Ok(TcpReply::Data(Bytes::from(bytes)))
            }
            None => Ok(TcpReply::Silent),
        }
    }
}

struct TcpHandler {
    wire: TcpWire,
    reply: TcpReply,
    forwarder: Forwarder<TcpWire>,
    requests: Arc<RequestLog>,
}

#[async_trait]
impl ConnectionHandler for TcpHandler {
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let request_from = socket_name(&peer);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER);

        loop {
            buffer.clear();
            match stream.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Read from {} failed: {}", request_from, e);
                    break;
                }
            }

            let request = match self.wire.parse_request(&buffer, &request_from) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring unreadable request from {}: {}", request_from, e);
                    continue;
                }
            };
            self.requests.record(request.clone());

            let payload = match &self.reply {
                TcpReply::Proxy(target) => match self.forwarder.forward(target, &request).await {
                    Ok(response) => response.data,
                    Err(e) => {
                        warn!("Proxy to {} failed: {}", target, e);
                        break;
                    }
                },
                TcpReply::Data(data) => data.clone(),
                TcpReply::Silent => continue,
            };

            if let Err(e) = stream.write_all(&payload).await {
                debug!("Write to {} failed: {}", request_from, e);
                break;
            }
        }
    }
}
