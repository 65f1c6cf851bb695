//! HTTP/1.1 message codec for proxying over a raw connection.
//!
//! Outbound requests are serialized with `Connection: close`; replies are
//! parsed incrementally so the forwarder can stop reading as soon as the
//! framing says the message is complete.

use crate::protocol::{HttpRequest, ProtocolError};
use crate::proxy::Endpoint;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Request headers the codec always writes itself.
const MANAGED_HEADERS: [&str; 6] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
];

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    ContentLength(usize),
    Chunked,
    CloseDelimited,
}

/// A fully framed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Serialize `request` for `target` as an HTTP/1.1 request.
pub fn format_request(request: &HttpRequest, target: &Endpoint) -> Bytes {
    let mut out = BytesMut::new();
    let path = if request.path.is_empty() {
        "/"
    } else {
        request.path.as_str()
    };

    let request_line = format!(
        "{} {}{} HTTP/1.1\r\n",
        request.method,
        path,
        query_string(&request.query)
    );
    out.put_slice(request_line.as_bytes());
    out.put_slice(format!("Host: {}\r\n", host_header(target)).as_bytes());

    for (name, value) in &request.headers {
        if MANAGED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        out.put_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    let body = request.body.as_deref().unwrap_or_default();
    if !body.is_empty() || matches!(request.method.as_str(), "POST" | "PUT" | "PATCH") {
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"Connection: close\r\n\r\n");
    out.put_slice(body.as_bytes());

    out.freeze()
}

fn query_string(query: &BTreeMap<String, String>) -> String {
    if query.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    format!("?{}", pairs.join("&"))
}

fn host_header(target: &Endpoint) -> String {
    let default_port = match target.scheme.as_str() {
        "https" => 443,
        _ => 80,
    };
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    if target.port == default_port {
        host
    } else {
        format!("{}:{}", host, target.port)
    }
}

/// Parse a raw HTTP/1.x request.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequest, ProtocolError> {
    let head_end = find(raw, HEAD_TERMINATOR)
        .ok_or_else(|| ProtocolError::Malformed("incomplete request head".into()))?;
    let head = std::str::from_utf8(&raw[..head_end])
        .map_err(|_| ProtocolError::Malformed("request head is not UTF-8".into()))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::Malformed(format!(
            "invalid request line '{request_line}'"
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(ProtocolError::Malformed(format!(
            "unsupported version '{version}'"
        )));
    }

    let headers = parse_headers(lines)?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, BTreeMap::new()),
    };

    let rest = &raw[head_end + HEAD_TERMINATOR.len()..];
    let body = match body_mode(&headers, false)? {
        BodyMode::ContentLength(len) if rest.len() >= len => Some(&rest[..len]),
        BodyMode::ContentLength(_) => {
            return Err(ProtocolError::Malformed("truncated request body".into()))
        }
        BodyMode::Chunked => {
            return Err(ProtocolError::Malformed(
                "chunked request bodies are not supported".into(),
            ))
        }
        BodyMode::None | BodyMode::CloseDelimited => None,
    }
    .filter(|b| !b.is_empty())
    .map(|b| String::from_utf8_lossy(b).into_owned());

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers: headers.into_iter().collect(),
        body,
    })
}

/// Decode a query string into a map; later duplicates win.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(s)
}

/// Parse `raw` as an HTTP response.
///
/// Returns `Ok(None)` while more data is needed. With `at_eof` set, a
/// close-delimited body ends at the end of `raw` and a short message is an error.
pub fn parse_response(raw: &[u8], at_eof: bool) -> Result<Option<ParsedResponse>, ProtocolError> {
    let mut offset = 0;

    loop {
        let Some(head_len) = find(&raw[offset..], HEAD_TERMINATOR) else {
            return incomplete(at_eof, "incomplete response head");
        };
        let head = std::str::from_utf8(&raw[offset..offset + head_len])
            .map_err(|_| ProtocolError::Malformed("response head is not UTF-8".into()))?;
        let body_start = offset + head_len + HEAD_TERMINATOR.len();

        let mut lines = head.split("\r\n");
        let status = parse_status_line(lines.next().unwrap_or_default())?;
        let headers = parse_headers(lines)?;

        // interim responses precede the real one
        if (100..200).contains(&status) && status != 101 {
            offset = body_start;
            continue;
        }

        let mode = if status == 204 || status == 304 || (100..200).contains(&status) {
            BodyMode::None
        } else {
            body_mode(&headers, true)?
        };

        let rest = &raw[body_start..];
        let body = match mode {
            BodyMode::None => Bytes::new(),
            BodyMode::ContentLength(len) if rest.len() >= len => {
                Bytes::copy_from_slice(&rest[..len])
            }
            BodyMode::ContentLength(_) => return incomplete(at_eof, "truncated response body"),
            BodyMode::Chunked => match decode_chunked(rest)? {
                Some(body) => body,
                None => return incomplete(at_eof, "truncated chunked body"),
            },
            BodyMode::CloseDelimited if at_eof => Bytes::copy_from_slice(rest),
            BodyMode::CloseDelimited => return Ok(None),
        };

        return Ok(Some(ParsedResponse {
            status,
            headers,
            body,
        }));
    }
}

fn incomplete<T>(at_eof: bool, reason: &str) -> Result<Option<T>, ProtocolError> {
    if at_eof {
        Err(ProtocolError::Malformed(reason.to_string()))
    } else {
        Ok(None)
    }
}

fn parse_status_line(line: &str) -> Result<u16, ProtocolError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(ProtocolError::Malformed(format!("invalid status line '{line}'")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
        .ok_or_else(|| ProtocolError::Malformed(format!("invalid status line '{line}'")))
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, ProtocolError> {
    lines
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or_else(|| ProtocolError::Malformed(format!("invalid header line '{line}'")))
        })
        .collect()
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn body_mode(headers: &[(String, String)], response: bool) -> Result<BodyMode, ProtocolError> {
    if let Some(encoding) = header(headers, "transfer-encoding") {
        if encoding
            .rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
        {
            return Ok(BodyMode::Chunked);
        }
    }
    if let Some(len) = header(headers, "content-length") {
        let len = len
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("invalid Content-Length '{len}'")))?;
        return Ok(BodyMode::ContentLength(len));
    }
    Ok(if response {
        BodyMode::CloseDelimited
    } else {
        BodyMode::None
    })
}

/// Decode a chunked body; `Ok(None)` if the terminating chunk has not arrived.
fn decode_chunked(mut data: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
    let mut body = BytesMut::new();

    loop {
        let Some(line_end) = find(data, b"\r\n") else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&data[..line_end])
            .map_err(|_| ProtocolError::Malformed("invalid chunk size".into()))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| ProtocolError::Malformed(format!("invalid chunk size '{size_hex}'")))?;
        data = &data[line_end + 2..];

        if size == 0 {
            // optional trailers, then an empty line
            if data.starts_with(b"\r\n") || find(data, HEAD_TERMINATOR).is_some() {
                return Ok(Some(body.freeze()));
            }
            return Ok(None);
        }

        if data.len() < size + 2 {
            return Ok(None);
        }
        body.put_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_rewrites_host_and_closes() {
        let mut req = request("POST", "/orders");
        req.query.insert("q".into(), "a b".into());
        req.headers.insert("host".into(), "localhost:4545".into());
        req.headers.insert("connection".into(), "keep-alive".into());
        req.headers.insert("x-trace".into(), "1".into());
        req.body = Some("{}".into());

        let raw = format_request(&req, &Endpoint::new("backend", 8080));
        let text = std::str::from_utf8(&raw).unwrap();

        assert!(text.starts_with("POST /orders?q=a%20b HTTP/1.1\r\n"));
        assert!(text.contains("Host: backend:8080\r\n"));
        assert!(text.contains("x-trace: 1\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n\r\n{}"));
        assert!(!text.contains("keep-alive"));
        assert!(!text.contains("localhost:4545"));
    }

    #[test]
    fn test_host_header_omits_default_port() {
        let target = Endpoint::parse("https://api.example.com").unwrap();
        let raw = format_request(&request("GET", "/"), &target);
        assert!(std::str::from_utf8(&raw)
            .unwrap()
            .contains("Host: api.example.com\r\n"));
    }

    #[test]
    fn test_parse_request_round_trip() {
        let mut original = request("PUT", "/items/1");
        original.query.insert("verbose".into(), "true".into());
        original.headers.insert("x-id".into(), "7".into());
        original.body = Some("payload".into());

        let parsed = parse_request(&format_request(&original, &Endpoint::new("h", 81))).unwrap();
        assert_eq!(parsed.method, "PUT");
        assert_eq!(parsed.path, "/items/1");
        assert_eq!(parsed.query.get("verbose").map(String::as_str), Some("true"));
        assert_eq!(parsed.headers.get("x-id").map(String::as_str), Some("7"));
        assert_eq!(parsed.body.as_deref(), Some("payload"));
    }

    #[test]
    fn test_parse_query_decodes() {
        let query = parse_query("name=John+Smith&city=New%20York&flag");
        assert_eq!(query["name"], "John Smith");
        assert_eq!(query["city"], "New York");
        assert_eq!(query["flag"], "");
    }

    #[test]
    fn test_content_length_framing() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel";
        assert_eq!(parse_response(raw, false).unwrap(), None);
        assert!(parse_response(raw, true).is_err());

        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello";
        let parsed = parse_response(raw, false).unwrap().unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(&parsed.body[..], b"hello");
        assert!(parsed.headers.contains(&("X-A".to_string(), "b".to_string())));
    }

    #[test]
    fn test_chunked_framing() {
        let partial = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
        assert_eq!(parse_response(partial, false).unwrap(), None);

        let full = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\n";
        let parsed = parse_response(full, false).unwrap().unwrap();
        assert_eq!(&parsed.body[..], b"hello world");
    }

    #[test]
    fn test_close_delimited_body() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nuntil close";
        assert_eq!(parse_response(raw, false).unwrap(), None);
        let parsed = parse_response(raw, true).unwrap().unwrap();
        assert_eq!(&parsed.body[..], b"until close");
    }

    #[test]
    fn test_no_body_statuses_and_interim() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let parsed = parse_response(raw, false).unwrap().unwrap();
        assert_eq!(parsed.status, 204);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_response(b"SSH-2.0-OpenSSH\r\n\r\n", false).is_err());
        assert!(parse_request(b"nonsense\r\n\r\n").is_err());
    }
}
