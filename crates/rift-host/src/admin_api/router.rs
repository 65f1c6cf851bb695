//! Route dispatch logic for the Admin API.

use crate::admin_api::handlers::{imposters, system};
use crate::admin_api::server::AdminState;
use crate::admin_api::types::{error_response, get_base_url, not_found};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Parsed route for imposter-specific endpoints
#[derive(Debug)]
enum ImposterRoute {
    /// GET/DELETE /imposters/:port
    Root,
    /// DELETE /imposters/:port/savedRequests
    SavedRequests,
    /// DELETE /imposters/:port/savedProxyResponses (and the older /requests)
    SavedProxyResponses,
    /// POST /imposters/:port/_requests
    Callback,
}

impl ImposterRoute {
    /// Parse route from path segments after `/imposters/:port`
    fn parse(segments: &[&str]) -> Option<Self> {
        match segments {
            [] | [""] => Some(ImposterRoute::Root),
            ["savedRequests"] => Some(ImposterRoute::SavedRequests),
            ["savedProxyResponses"] | ["requests"] => Some(ImposterRoute::SavedProxyResponses),
            ["_requests"] => Some(ImposterRoute::Callback),
            _ => None,
        }
    }
}

/// Main request router
pub async fn route_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|s| s.to_string());
    let base_url = get_base_url(&req);

    debug!("Admin API: {} {}", method, path);

    let response = route_by_path(&method, &path, query.as_deref(), req, &base_url, state).await;
    Ok(response)
}

/// Route based on path
async fn route_by_path(
    method: &Method,
    path: &str,
    query: Option<&str>,
    req: Request<Incoming>,
    base_url: &str,
    state: Arc<AdminState>,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/") => return system::handle_root(base_url),
        (&Method::GET, "/config") => return system::handle_config(&state),
        _ => {}
    }

    let manager = Arc::clone(&state.manager);

    // Imposter collection routes
    if path == "/imposters" {
        return match *method {
            Method::GET => imposters::handle_list(manager, query, base_url).await,
            Method::POST => imposters::handle_create(req, base_url, manager).await,
            Method::PUT => imposters::handle_replace_all(req, base_url, manager).await,
            Method::DELETE => imposters::handle_delete_all(manager).await,
            _ => not_found(),
        };
    }

    // Individual imposter routes
    if let Some(rest) = path.strip_prefix("/imposters/") {
        return route_imposter(method, rest, query, req, base_url, manager).await;
    }

    not_found()
}

/// Route imposter-specific requests
async fn route_imposter(
    method: &Method,
    path: &str,
    query: Option<&str>,
    req: Request<Incoming>,
    base_url: &str,
    manager: Arc<crate::imposter::ImposterManager>,
) -> Response<Full<Bytes>> {
    // Parse: port/remaining/path
    let segments: Vec<&str> = path.split('/').collect();

    let port: u16 = match segments[0].parse() {
        Ok(p) => p,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "bad data", "Invalid port number")
        }
    };

    let route = match ImposterRoute::parse(&segments[1..]) {
        Some(r) => r,
        None => return not_found(),
    };

    match (method, route) {
        (&Method::GET, ImposterRoute::Root) => {
            imposters::handle_get(port, query, base_url, manager).await
        }
        (&Method::DELETE, ImposterRoute::Root) => imposters::handle_delete(port, manager).await,
        (&Method::DELETE, ImposterRoute::SavedRequests) => {
            imposters::handle_clear_requests(port, base_url, manager).await
        }
        (&Method::DELETE, ImposterRoute::SavedProxyResponses) => {
            imposters::handle_reset_proxies(port, base_url, manager).await
        }
        (&Method::POST, ImposterRoute::Callback) => {
            imposters::handle_callback(port, req, manager).await
        }
        _ => not_found(),
    }
}
