//! Imposter CRUD handlers.

use crate::admin_api::types::*;
use crate::imposter::{ImposterConfig, ImposterError, ImposterManager, ResponsePlan};
use crate::protocol::{CapturedRequest, RequestBody};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// POST /imposters - Create a new imposter
pub async fn handle_create(
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "bad data", &e),
    };

    let config: ImposterConfig = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => return invalid_json(e),
    };

    let port = match manager.create_imposter(config).await {
        Ok(port) => port,
        Err(e) => {
            error!("Failed to create imposter: {}", e);
            return imposter_error_response(&e);
        }
    };

    match manager.get_imposter(port) {
        Ok(imposter) => {
            let location = format!("{}/imposters/{}", base_url, port);
            let body = imposter_json(&imposter, base_url, false);
            let json = serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string());
            build_response_with_headers(
                StatusCode::CREATED,
                [
                    ("Content-Type", "application/json"),
                    ("Location", location.as_str()),
                ],
                json,
            )
        }
        // deleted between create and lookup
        Err(e) => imposter_error_response(&e),
    }
}

/// GET /imposters - List all imposters
pub async fn handle_list(
    manager: Arc<ImposterManager>,
    query: Option<&str>,
    base_url: &str,
) -> Response<Full<Bytes>> {
    let params = ImposterQueryParams::parse(query);
    let imposters = manager.list_imposters();

    if params.replayable {
        let configs: Vec<Value> = imposters.iter().map(|i| replayable_json(i)).collect();
        json_response(StatusCode::OK, &json!({ "imposters": configs }))
    } else {
        let response = ListImpostersResponse {
            imposters: imposters
                .iter()
                .map(|i| ImposterSummary::new(i, base_url))
                .collect(),
        };
        json_response(StatusCode::OK, &response)
    }
}

/// PUT /imposters - Replace all imposters
pub async fn handle_replace_all(
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    let body = match collect_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "bad data", &e),
    };

    #[derive(Deserialize)]
    struct BatchRequest {
        #[serde(default)]
        imposters: Vec<ImposterConfig>,
    }

    let batch: BatchRequest = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => return invalid_json(e),
    };

    manager.delete_all().await;

    for config in batch.imposters {
        let port = config.port;
        if let Err(e) = manager.create_imposter(config).await {
            error!("Failed to create imposter on port {:?}: {}", port, e);
            return imposter_error_response(&e);
        }
    }

    handle_list(manager, None, base_url).await
}

/// DELETE /imposters - Delete all imposters
pub async fn handle_delete_all(manager: Arc<ImposterManager>) -> Response<Full<Bytes>> {
    let removed = manager.delete_all().await;
    let configs: Vec<Value> = removed.iter().map(|i| replayable_json(i)).collect();
    json_response(StatusCode::OK, &json!({ "imposters": configs }))
}

/// GET /imposters/:port - Get a specific imposter
pub async fn handle_get(
    port: u16,
    query: Option<&str>,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    let params = ImposterQueryParams::parse(query);

    match manager.get_imposter(port) {
        Ok(imposter) => json_response(
            StatusCode::OK,
            &imposter_json(&imposter, base_url, params.replayable),
        ),
        Err(e) => imposter_error_response(&e),
    }
}

/// DELETE /imposters/:port - Delete a specific imposter
pub async fn handle_delete(port: u16, manager: Arc<ImposterManager>) -> Response<Full<Bytes>> {
    match manager.delete_imposter(port).await {
        Ok(imposter) => json_response(StatusCode::OK, &replayable_json(&imposter)),
        Err(ImposterError::NotFound(_)) => json_response(StatusCode::OK, &json!({})),
        Err(e) => imposter_error_response(&e),
    }
}

/// DELETE /imposters/:port/savedRequests - Clear recorded requests
pub async fn handle_clear_requests(
    port: u16,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.get_imposter(port) {
        Ok(imposter) => {
            imposter.requests.clear();
            json_response(StatusCode::OK, &imposter_json(&imposter, base_url, false))
        }
        Err(e) => imposter_error_response(&e),
    }
}

/// DELETE /imposters/:port/savedProxyResponses - Reset saved proxy responses
///
/// Proxies forward transparently and never add stubs, so there is nothing to
/// drop; the imposter is returned as it stands.
pub async fn handle_reset_proxies(
    port: u16,
    base_url: &str,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    match manager.get_imposter(port) {
        Ok(imposter) => json_response(StatusCode::OK, &imposter_json(&imposter, base_url, false)),
        Err(e) => imposter_error_response(&e),
    }
}

/// POST /imposters/:port/_requests - Request callback from an out-of-process protocol
pub async fn handle_callback(
    port: u16,
    req: Request<Incoming>,
    manager: Arc<ImposterManager>,
) -> Response<Full<Bytes>> {
    let imposter = match manager.get_imposter(port) {
        Ok(imposter) => imposter,
        Err(e) => return imposter_error_response(&e),
    };

    let body = match collect_body(req).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "bad data", &e),
    };

    #[derive(Deserialize)]
    struct CallbackRequest {
        #[serde(default)]
        request: Map<String, Value>,
    }

    let callback: CallbackRequest = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => return invalid_json(e),
    };

    let request = captured_from_callback(callback.request);
    debug!(
        "{} imposter on port {} received request from {}",
        imposter.protocol(),
        port,
        request.request_from
    );
    imposter.requests.record(request);

    let response = match imposter.config.response_plan() {
        Ok(ResponsePlan::Is(is)) => json!({ "response": is }),
        Ok(ResponsePlan::Proxy(endpoint)) => json!({
            "proxy": { "to": format!("{}://{}", endpoint.scheme, endpoint) }
        }),
        Ok(ResponsePlan::Default(default_response)) => {
            json!({ "response": default_response.unwrap_or_else(|| json!({})) })
        }
        Err(e) => return imposter_error_response(&e),
    };
    json_response(StatusCode::OK, &response)
}

/// Lift `requestFrom` out of a callback request; the rest is the opaque body.
fn captured_from_callback(mut request: Map<String, Value>) -> CapturedRequest {
    let request_from = match request.remove("requestFrom") {
        Some(Value::String(from)) => from,
        _ => String::new(),
    };
    request.remove("timestamp");
    CapturedRequest::new(request_from, RequestBody::Custom(request))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captured_from_callback() {
        let request = json!({
            "requestFrom": "10.0.0.1:5000",
            "timestamp": "old",
            "data": "hello"
        });
        let Value::Object(map) = request else {
            unreachable!()
        };

        let captured = captured_from_callback(map);
        assert_eq!(captured.request_from, "10.0.0.1:5000");
        assert_ne!(captured.timestamp, "old");
        match captured.body {
            RequestBody::Custom(body) => {
                assert_eq!(body.get("data"), Some(&json!("hello")));
                assert!(!body.contains_key("requestFrom"));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_callback_without_origin() {
        let captured = captured_from_callback(Map::new());
        assert_eq!(captured.request_from, "");
    }
}
