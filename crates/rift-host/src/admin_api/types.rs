//! Response types and HATEOAS structures for the Admin API.

use crate::imposter::{Imposter, ImposterError};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};

/// HATEOAS link structure for Mountebank compatibility
#[derive(Debug, Serialize, Clone)]
pub struct Link {
    pub href: String,
}

/// HATEOAS links for imposter resources
#[derive(Debug, Serialize, Clone)]
pub struct ImposterLinks {
    #[serde(rename = "self")]
    pub self_link: Link,
    #[serde(rename = "savedRequests")]
    pub saved_requests: Link,
}

/// Imposter summary for list responses
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImposterSummary {
    pub protocol: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub number_of_requests: u64,
    #[serde(rename = "_links")]
    pub links: ImposterLinks,
}

impl ImposterSummary {
    pub fn new(imposter: &Imposter, base_url: &str) -> Self {
        Self {
            protocol: imposter.protocol().to_string(),
            port: imposter.port,
            name: imposter.config.name.clone(),
            number_of_requests: imposter.requests.count(),
            links: make_imposter_links(base_url, imposter.port),
        }
    }
}

/// Response for listing imposters
#[derive(Debug, Serialize)]
pub struct ListImpostersResponse {
    pub imposters: Vec<ImposterSummary>,
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorDetail>,
}

/// Individual error detail
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Query parameters for imposter endpoints
#[derive(Debug, Default)]
pub struct ImposterQueryParams {
    pub replayable: bool,
}

impl ImposterQueryParams {
    /// Parse query parameters from query string
    pub fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        if let Some(q) = query {
            params.replayable = q
                .split('&')
                .any(|pair| pair.eq_ignore_ascii_case("replayable=true"));
        }
        params
    }
}

// =============================================================================
// Imposter rendering
// =============================================================================

/// The imposter's configuration, as it would be posted to recreate it.
pub fn replayable_json(imposter: &Imposter) -> Value {
    serde_json::to_value(&imposter.config).unwrap_or_else(|_| json!({}))
}

/// Full imposter representation: configuration plus request introspection.
pub fn imposter_json(imposter: &Imposter, base_url: &str, replayable: bool) -> Value {
    let mut body = replayable_json(imposter);
    if replayable {
        return body;
    }

    if let Value::Object(fields) = &mut body {
        fields.insert("numberOfRequests".into(), json!(imposter.requests.count()));
        fields.insert(
            "requests".into(),
            serde_json::to_value(imposter.requests.requests()).unwrap_or_else(|_| json!([])),
        );
        fields.insert(
            "_links".into(),
            serde_json::to_value(make_imposter_links(base_url, imposter.port))
                .unwrap_or_else(|_| json!({})),
        );
    }
    body
}

// =============================================================================
// Helper functions for generating HATEOAS links
// =============================================================================

/// Extract base URL from request headers for HATEOAS links
pub fn get_base_url(req: &Request<Incoming>) -> String {
    if let Some(host) = req.headers().get("host") {
        if let Ok(host_str) = host.to_str() {
            return format!("http://{}", host_str);
        }
    }
    "http://localhost:2525".to_string()
}

/// Generate HATEOAS links for an imposter
pub fn make_imposter_links(base_url: &str, port: u16) -> ImposterLinks {
    ImposterLinks {
        self_link: Link {
            href: format!("{}/imposters/{}", base_url, port),
        },
        saved_requests: Link {
            href: format!("{}/imposters/{}/savedRequests", base_url, port),
        },
    }
}

// =============================================================================
// Response helper functions
// =============================================================================

/// Create a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    build_response_with_headers(status, [("Content-Type", "application/json")], json)
}

/// Build an HTTP response with headers.
///
/// Falls back to a bare response if the builder rejects a header.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (key, value) in headers {
        builder = builder.header(key.as_ref(), value.as_ref());
    }
    builder
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

/// Create a Mountebank error response
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    let error = ErrorResponse {
        errors: vec![ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        }],
    };
    json_response(status, &error)
}

/// Map an imposter error onto its status and Mountebank code
pub fn imposter_error_response(error: &ImposterError) -> Response<Full<Bytes>> {
    let status = match error {
        ImposterError::NotFound(_) => StatusCode::NOT_FOUND,
        ImposterError::PortInUse(_)
        | ImposterError::BindError(..)
        | ImposterError::InvalidProtocol(_)
        | ImposterError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        ImposterError::Start(_) | ImposterError::Lifecycle(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, error.code(), &error.to_string())
}

/// Create a not found response
pub fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "no such resource", "Not Found")
}

/// Create an invalid JSON response
pub fn invalid_json(e: impl std::fmt::Display) -> Response<Full<Bytes>> {
    error_response(
        StatusCode::BAD_REQUEST,
        "invalid JSON",
        &format!("Unable to parse body as JSON: {e}"),
    )
}

/// Collect request body into bytes
pub async fn collect_body(req: Request<Incoming>) -> Result<Bytes, String> {
    use http_body_util::BodyExt;
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| format!("Failed to read request body: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Full<Bytes>>) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_imposter_query_params_parse() {
        assert!(ImposterQueryParams::parse(Some("replayable=true")).replayable);
        assert!(ImposterQueryParams::parse(Some("a=b&replayable=true")).replayable);
        assert!(!ImposterQueryParams::parse(Some("replayable=false")).replayable);
        assert!(!ImposterQueryParams::parse(None).replayable);
    }

    #[test]
    fn test_make_imposter_links() {
        let links = make_imposter_links("http://localhost:2525", 8080);
        assert_eq!(links.self_link.href, "http://localhost:2525/imposters/8080");
        assert_eq!(
            links.saved_requests.href,
            "http://localhost:2525/imposters/8080/savedRequests"
        );
    }

    #[tokio::test]
    async fn test_error_response_format() {
        let resp = error_response(StatusCode::BAD_REQUEST, "bad data", "Test error");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            json!({"errors": [{"code": "bad data", "message": "Test error"}]})
        );
    }

    #[test]
    fn test_imposter_error_status() {
        assert_eq!(
            imposter_error_response(&ImposterError::PortInUse(4545)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            imposter_error_response(&ImposterError::NotFound(4545)).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            imposter_error_response(&ImposterError::Start("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_response() {
        let body = json!({"test": "value"});
        let resp = json_response(StatusCode::OK, &body);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_not_found_response() {
        let resp = not_found();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
