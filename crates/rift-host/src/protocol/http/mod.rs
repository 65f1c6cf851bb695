//! HTTP and HTTPS imposters.
//!
//! Connections are served by hyper's HTTP/1 server. HTTPS imposters
//! terminate TLS with the PEM `key`/`cert` from their configuration before
//! handing the stream to hyper.

pub mod codec;

use super::{
    bind_listener, CapturedRequest, HttpRequest, ImposterContext, ImposterServer, ListenerServer,
    Protocol, ProtocolError, RequestBody, WireFormat,
};
use crate::imposter::{ImposterConfig, ImposterError, RequestLog, ResponsePlan};
use crate::lifecycle::{socket_name, AllowList, ConnectionHandler, ConnectionManager};
use crate::proxy::{create_tls_acceptor, Endpoint, Forwarder, ForwarderConfig, ProxyError};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Response headers that describe the downstream connection, not the message.
const HOP_BY_HOP: [&str; 4] = ["transfer-encoding", "connection", "keep-alive", "content-length"];

/// HTTP/1.1 wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpWire;

impl WireFormat for HttpWire {
    fn format_request(
        &self,
        request: &CapturedRequest,
        target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        match &request.body {
            RequestBody::Http(http) => Ok(codec::format_request(http, target)),
            _ => Err(ProtocolError::Malformed(
                "http proxy requires an http request".into(),
            )),
        }
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        let request = codec::parse_request(raw)?;
        Ok(CapturedRequest::new(request_from, RequestBody::Http(request)))
    }

    fn response_complete(&self, received: &[u8]) -> bool {
        matches!(codec::parse_response(received, false), Ok(Some(_)))
    }
}

/// The built-in `http` and `https` protocols.
pub struct HttpProtocol {
    tls: bool,
    forwarder: ForwarderConfig,
}

impl HttpProtocol {
    pub fn new(tls: bool, forwarder: ForwarderConfig) -> Self {
        Self { tls, forwarder }
    }

    fn acceptor(&self, config: &ImposterConfig) -> Result<Option<TlsAcceptor>, ImposterError> {
        if !self.tls {
            return Ok(None);
        }
        let (Some(key), Some(cert)) = (config.key.as_deref(), config.cert.as_deref()) else {
            return Err(ImposterError::InvalidConfig(
                "https imposters require both 'key' and 'cert'".into(),
            ));
        };
        create_tls_acceptor(cert, key)
            .map(Some)
            .map_err(|e| ImposterError::InvalidConfig(e.to_string()))
    }
}

impl WireFormat for HttpProtocol {
    fn format_request(
        &self,
        request: &CapturedRequest,
        target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        HttpWire.format_request(request, target)
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        HttpWire.parse_request(raw, request_from)
    }

    fn response_complete(&self, received: &[u8]) -> bool {
        HttpWire.response_complete(received)
    }
}

#[async_trait]
impl Protocol for HttpProtocol {
    async fn start(
        &self,
        config: &ImposterConfig,
        context: ImposterContext,
    ) -> Result<Box<dyn ImposterServer>, ImposterError> {
        let reply = HttpReply::from_plan(config.response_plan()?)?;
        let acceptor = self.acceptor(config)?;
        let listener = bind_listener(config).await?;

        let handler = Arc::new(HttpHandler {
            acceptor,
            responder: Arc::new(Responder {
                reply,
                forwarder: Forwarder::new(HttpWire, self.forwarder),
                requests: context.requests,
            }),
        });
        let connections = ConnectionManager::start(listener, AllowList::any(), handler)
            .map_err(|e| ImposterError::Start(e.to_string()))?;

        Ok(Box::new(ListenerServer::new(connections)))
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Canned `is` response, validated when the imposter starts.
#[derive(Debug, Clone)]
struct CannedResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CannedResponse {
    fn from_value(response: Option<&Value>) -> Result<Self, ImposterError> {
        let invalid = |msg: String| ImposterError::InvalidConfig(msg);
        let Some(response) = response else {
            return Ok(Self {
                status: StatusCode::OK,
                headers: Vec::new(),
                body: Bytes::new(),
            });
        };

        let status = match response.get("statusCode") {
            None | Some(Value::Null) => StatusCode::OK,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|code| u16::try_from(code).ok())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| invalid(format!("invalid statusCode {n}")))?,
            Some(Value::String(s)) => s
                .parse::<u16>()
                .ok()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or_else(|| invalid(format!("invalid statusCode '{s}'")))?,
            Some(other) => return Err(invalid(format!("invalid statusCode {other}"))),
        };

        let mut headers = Vec::new();
        if let Some(Value::Object(map)) = response.get("headers") {
            for (name, value) in map {
                let values: Vec<String> = match value {
                    Value::Array(items) => items.iter().map(header_text).collect(),
                    other => vec![header_text(other)],
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| invalid(format!("invalid header name '{name}': {e}")))?;
                for value in values {
                    let value = HeaderValue::from_str(&value)
                        .map_err(|e| invalid(format!("invalid value for header '{name}': {e}")))?;
                    headers.push((name.clone(), value));
                }
            }
        }

        let body = match response.get("body") {
            None | Some(Value::Null) => Bytes::new(),
            Some(Value::String(s)) => Bytes::from(s.clone()),
            Some(other) => {
                if !headers.iter().any(|(name, _)| name == CONTENT_TYPE) {
                    headers.push((CONTENT_TYPE, HeaderValue::from_static("application/json")));
                }
                Bytes::from(serde_json::to_string_pretty(other).unwrap_or_default())
            }
        };

        Ok(Self {
            status,
            headers,
            body,
        })
    }

    fn to_response(&self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body.clone()));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            response.headers_mut().append(name.clone(), value.clone());
        }
        response
    }
}

fn header_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

enum HttpReply {
    Proxy(Endpoint),
    Canned(CannedResponse),
}

impl HttpReply {
    fn from_plan(plan: ResponsePlan) -> Result<Self, ImposterError> {
        Ok(match plan {
            ResponsePlan::Proxy(target) => HttpReply::Proxy(target),
            ResponsePlan::Is(response) => {
                HttpReply::Canned(CannedResponse::from_value(Some(&response))?)
            }
            ResponsePlan::Default(response) => {
                HttpReply::Canned(CannedResponse::from_value(response.as_ref())?)
            }
        })
    }
}

struct Responder {
    reply: HttpReply,
    forwarder: Forwarder<HttpWire>,
    requests: Arc<RequestLog>,
}

impl Responder {
    async fn respond(
        &self,
        req: Request<Incoming>,
        request_from: &str,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let request = match capture(req).await {
            Ok(request) => CapturedRequest::new(request_from, RequestBody::Http(request)),
            Err(e) => {
                debug!("Failed to read request from {}: {}", request_from, e);
                return Ok(error_response(StatusCode::BAD_REQUEST, "bad data", &e.to_string()));
            }
        };
        self.requests.record(request.clone());

        let response = match &self.reply {
            HttpReply::Canned(canned) => canned.to_response(),
            HttpReply::Proxy(target) => match self.forwarder.forward(target, &request).await {
                Ok(proxied) => proxied_response(&proxied.data, target),
                Err(e) => {
                    warn!("Proxy to {} failed: {}", target, e);
                    proxy_error_response(&e)
                }
            },
        };
        Ok(response)
    }
}

async fn capture(req: Request<Incoming>) -> Result<HttpRequest, hyper::Error> {
    let (parts, body) = req.into_parts();

    let query = parts
        .uri
        .query()
        .map(codec::parse_query)
        .unwrap_or_default();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &parts.headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let body = body.collect().await?.to_bytes();
    let body = (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned());

    Ok(HttpRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query,
        headers,
        body,
    })
}

fn proxied_response(raw: &[u8], target: &Endpoint) -> Response<Full<Bytes>> {
    let parsed = match codec::parse_response(raw, true) {
        Ok(Some(parsed)) => parsed,
        Ok(None) | Err(_) => {
            warn!("Unparseable response from {}", target);
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "invalid proxy",
                &format!("Invalid HTTP response from {target}"),
            );
        }
    };

    let mut response = Response::new(Full::new(parsed.body));
    *response.status_mut() =
        StatusCode::from_u16(parsed.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &parsed.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
        .headers_mut()
        .insert("x-rift-imposter", HeaderValue::from_static("true"));
    response
        .headers_mut()
        .insert("x-rift-proxy", HeaderValue::from_static("true"));
    response
}

fn proxy_error_response(error: &ProxyError) -> Response<Full<Bytes>> {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        error.code(),
        &error.to_string(),
    )
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    let body = json!({ "errors": [{ "code": code, "message": message }] });
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

// ============================================================================
// Connection handling
// ============================================================================

struct HttpHandler {
    acceptor: Option<TlsAcceptor>,
    responder: Arc<Responder>,
}

impl HttpHandler {
    async fn serve<S>(&self, io: S, request_from: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let responder = Arc::clone(&self.responder);
        let peer = request_from.clone();
        let service = service_fn(move |req| {
            let responder = Arc::clone(&responder);
            let request_from = request_from.clone();
            async move { responder.respond(req, &request_from).await }
        });

        // forwarders half-close after writing and still expect the reply
        if let Err(e) = http1::Builder::new()
            .half_close(true)
            .serve_connection(TokioIo::new(io), service)
            .await
        {
            debug!("Connection error with {}: {}", peer, e);
        }
    }
}

#[async_trait]
impl ConnectionHandler for HttpHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let request_from = socket_name(&peer);
        match &self.acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => self.serve(tls, request_from).await,
                Err(e) => debug!("TLS handshake with {} failed: {}", request_from, e),
            },
            None => self.serve(stream, request_from).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imposter::Stub;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn context(requests: &Arc<RequestLog>) -> ImposterContext {
        ImposterContext {
            requests: Arc::clone(requests),
            callback_url_template: String::new(),
        }
    }

    #[test]
    fn test_canned_response_defaults() {
        let canned = CannedResponse::from_value(None).unwrap();
        assert_eq!(canned.status, StatusCode::OK);
        assert!(canned.body.is_empty());
    }

    #[test]
    fn test_canned_response_json_body() {
        let canned = CannedResponse::from_value(Some(&json!({
            "statusCode": "201",
            "headers": { "X-Multi": ["a", "b"], "X-Count": 3 },
            "body": { "id": 1 }
        })))
        .unwrap();
        assert_eq!(canned.status, StatusCode::CREATED);
        assert_eq!(canned.headers.iter().filter(|(n, _)| n == "x-multi").count(), 2);
        assert!(canned
            .headers
            .iter()
            .any(|(n, v)| n == "x-count" && v == "3"));
        assert!(canned.headers.iter().any(|(n, _)| n == CONTENT_TYPE));
        let body: Value = serde_json::from_slice(&canned.body).unwrap();
        assert_eq!(body["id"], 1);
    }

    #[test]
    fn test_canned_response_rejects_bad_status() {
        assert!(CannedResponse::from_value(Some(&json!({ "statusCode": 42 }))).is_err());
    }

    #[test]
    fn test_response_complete_uses_framing() {
        assert!(HttpWire.response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"));
        assert!(!HttpWire.response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\no"));
    }

    #[test]
    fn test_proxied_response_marks_and_strips_headers() {
        let raw = b"HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 4\r\nX-Up: 1\r\n\r\nnope";
        let response = proxied_response(raw, &Endpoint::new("backend", 80));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-up"], "1");
        assert_eq!(response.headers()["x-rift-proxy"], "true");
        assert!(response.headers().get("connection").is_none());
    }

    #[tokio::test]
    async fn test_https_requires_key_and_cert() {
        let requests = Arc::new(RequestLog::new(false));
        let config = ImposterConfig {
            protocol: "https".into(),
            host: Some("127.0.0.1".into()),
            ..Default::default()
        };
        let result = HttpProtocol::new(true, ForwarderConfig::default())
            .start(&config, context(&requests))
            .await;
        assert!(matches!(result, Err(ImposterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_serves_canned_response_and_records() {
        let requests = Arc::new(RequestLog::new(true));
        let config = ImposterConfig {
            host: Some("127.0.0.1".into()),
            stubs: vec![Stub {
                responses: vec![json!({ "is": { "statusCode": 202, "body": "accepted" } })],
                ..Default::default()
            }],
            ..Default::default()
        };

        let server = HttpProtocol::new(false, ForwarderConfig::default())
            .start(&config, context(&requests))
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
        client
            .write_all(b"GET /status?verbose=1 HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();

        let parsed = codec::parse_response(&raw, true).unwrap().unwrap();
        assert_eq!(parsed.status, 202);
        assert_eq!(&parsed.body[..], b"accepted");

        let recorded = requests.requests();
        assert_eq!(recorded.len(), 1);
        match &recorded[0].body {
            RequestBody::Http(http) => {
                assert_eq!(http.method, "GET");
                assert_eq!(http.path, "/status");
                assert_eq!(http.query["verbose"], "1");
                assert_eq!(http.headers["host"], "test");
            }
            other => panic!("unexpected body {other:?}"),
        }

        server.stop().await.unwrap();
    }
}
