//! Admin API connection handler.

use crate::admin_api::router::route_request;
use crate::imposter::ImposterManager;
use crate::lifecycle::{socket_name, ConnectionHandler};
use async_trait::async_trait;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::debug;

/// State shared by every admin request
pub struct AdminState {
    pub manager: Arc<ImposterManager>,
    /// Effective server options, echoed by `/config`
    pub options: Value,
    pub started_at: Instant,
}

/// Serves the admin API on connections admitted by a `ConnectionManager`
pub struct AdminApi {
    state: Arc<AdminState>,
}

impl AdminApi {
    pub fn new(manager: Arc<ImposterManager>, options: Value) -> Self {
        Self {
            state: Arc::new(AdminState {
                manager,
                options,
                started_at: Instant::now(),
            }),
        }
    }
}

#[async_trait]
impl ConnectionHandler for AdminApi {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let state = Arc::clone(&self.state);

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { route_request(req, state).await }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            debug!("Admin API connection error with {}: {}", socket_name(&peer), e);
        }
    }
}
