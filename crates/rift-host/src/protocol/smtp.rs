//! SMTP imposters.
//!
//! A minimal SMTP server that accepts every message and records it. SMTP
//! imposters cannot proxy.

use super::{
    bind_listener, CapturedRequest, ImposterContext, ImposterServer, ListenerServer, Protocol,
    ProtocolError, RequestBody, SmtpRequest, WireFormat,
};
use crate::imposter::{ImposterConfig, ImposterError, RequestLog};
use crate::lifecycle::{socket_name, AllowList, ConnectionHandler, ConnectionManager};
use crate::proxy::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

/// RFC 5321 allows 1000 octets per line; leave room for sloppy clients.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// The built-in `smtp` protocol.
#[derive(Debug, Default)]
pub struct SmtpProtocol;

impl SmtpProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl WireFormat for SmtpProtocol {
    fn format_request(
        &self,
        _request: &CapturedRequest,
        _target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        Err(ProtocolError::ProxyUnsupported("smtp".into()))
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::Malformed("message is not UTF-8".into()))?;
        Ok(CapturedRequest::new(
            request_from,
            RequestBody::Smtp(parse_message(String::new(), Vec::new(), text)),
        ))
    }
}

#[async_trait]
impl Protocol for SmtpProtocol {
    async fn start(
        &self,
        config: &ImposterConfig,
        context: ImposterContext,
    ) -> Result<Box<dyn ImposterServer>, ImposterError> {
        let listener = bind_listener(config).await?;
        let handler = Arc::new(SmtpHandler {
            requests: context.requests,
        });
        let connections = ConnectionManager::start(listener, AllowList::any(), handler)
            .map_err(|e| ImposterError::Start(e.to_string()))?;

        Ok(Box::new(ListenerServer::new(connections)))
    }
}

/// Build a captured message from its envelope and DATA content.
pub fn parse_message(envelope_from: String, envelope_to: Vec<String>, data: &str) -> SmtpRequest {
    let normalized = data.replace("\r\n", "\n");
    let (head, body) = normalized
        .split_once("\n\n")
        .unwrap_or((normalized.as_str(), ""));

    // unfold continuation lines into their header
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };
    let addresses = |name: &str| -> Vec<String> {
        header(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };

    SmtpRequest {
        envelope_from,
        envelope_to,
        from: header("from"),
        to: addresses("to"),
        cc: addresses("cc"),
        subject: header("subject"),
        text: body.trim_end_matches('\n').to_string(),
    }
}

/// Address from a `MAIL FROM:`/`RCPT TO:` argument.
fn envelope_address(argument: &str, prefix: &str) -> Option<String> {
    let rest = argument
        .get(..prefix.len())
        .filter(|p| p.eq_ignore_ascii_case(prefix))
        .map(|_| argument[prefix.len()..].trim())?;
    let address = match (rest.find('<'), rest.find('>')) {
        (Some(open), Some(close)) if open < close => &rest[open + 1..close],
        _ => rest.split_whitespace().next().unwrap_or_default(),
    };
    Some(address.to_string())
}

#[derive(Default)]
struct Session {
    envelope_from: String,
    envelope_to: Vec<String>,
    data: Option<String>,
}

impl Session {
    fn reset(&mut self) {
        *self = Session::default();
    }
}

struct SmtpHandler {
    requests: Arc<RequestLog>,
}

async fn reply(writer: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await
}

#[async_trait]
impl ConnectionHandler for SmtpHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let request_from = socket_name(&peer);
        let (reader, mut writer) = stream.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut session = Session::default();

        if reply(&mut writer, "220 rift-host ESMTP ready").await.is_err() {
            return;
        }

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("SMTP read from {} failed: {}", request_from, e);
                    break;
                }
            };

            if let Some(data) = session.data.as_mut() {
                if line == "." {
                    let message = parse_message(
                        std::mem::take(&mut session.envelope_from),
                        std::mem::take(&mut session.envelope_to),
                        data,
                    );
                    debug!("Received message from {} via {}", message.envelope_from, request_from);
                    self.requests.record(CapturedRequest::new(
                        request_from.as_str(),
                        RequestBody::Smtp(message),
                    ));
                    session.reset();
                    if reply(&mut writer, "250 OK: message queued").await.is_err() {
                        break;
                    }
                } else {
                    let content = line
                        .strip_prefix('.')
                        .filter(|_| line.starts_with(".."))
                        .unwrap_or(&line);
                    data.push_str(content);
                    data.push('\n');
                }
                continue;
            }

            let (verb, argument) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            let response = match verb.to_ascii_uppercase().as_str() {
                "HELO" | "EHLO" => "250 rift-host".to_string(),
                "MAIL" => match envelope_address(argument, "FROM:") {
                    Some(address) => {
                        session.reset();
                        session.envelope_from = address;
                        "250 OK".to_string()
                    }
                    None => "501 Syntax: MAIL FROM:<address>".to_string(),
                },
                "RCPT" => match envelope_address(argument, "TO:") {
                    Some(address) => {
                        session.envelope_to.push(address);
                        "250 OK".to_string()
                    }
                    None => "501 Syntax: RCPT TO:<address>".to_string(),
                },
                "DATA" if session.envelope_to.is_empty() => "503 Need RCPT first".to_string(),
                "DATA" => {
                    session.data = Some(String::new());
                    "354 End data with <CR><LF>.<CR><LF>".to_string()
                }
                "RSET" => {
                    session.reset();
                    "250 OK".to_string()
                }
                "NOOP" => "250 OK".to_string(),
                "QUIT" => {
                    let _ = reply(&mut writer, "221 Bye").await;
                    break;
                }
                other => format!("502 Command {other} not implemented"),
            };

            if reply(&mut writer, &response).await.is_err() {
                break;
            }
        }
    }
}
