//! Core Imposter struct and its request log.

use super::types::ImposterConfig;
use crate::lifecycle::LifecycleError;
use crate::protocol::{CapturedRequest, ImposterServer};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Requests seen by one imposter.
#[derive(Debug, Default)]
pub struct RequestLog {
    record_requests: bool,
    requests: RwLock<Vec<CapturedRequest>>,
    count: AtomicU64,
}

impl RequestLog {
    pub fn new(record_requests: bool) -> Self {
        Self {
            record_requests,
            requests: RwLock::new(Vec::new()),
            count: AtomicU64::new(0),
        }
    }

    /// Count the request and keep it if recording is on.
    pub fn record(&self, request: CapturedRequest) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.record_requests {
            self.requests.write().push(request);
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.read().clone()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Forget recorded requests and reset the counter.
    pub fn clear(&self) {
        self.requests.write().clear();
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.record_requests
    }
}

/// Runtime state of an imposter
pub struct Imposter {
    pub config: ImposterConfig,
    pub port: u16,
    pub requests: Arc<RequestLog>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    server: Box<dyn ImposterServer>,
}

impl Imposter {
    pub fn new(
        config: ImposterConfig,
        requests: Arc<RequestLog>,
        server: Box<dyn ImposterServer>,
    ) -> Self {
        let port = server.port();
        Self {
            config: ImposterConfig {
                port: Some(port),
                ..config
            },
            port,
            requests,
            created_at: chrono::Utc::now(),
            server,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.config.protocol
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        debug!("Stopping {} imposter on port {}", self.protocol(), self.port);
        self.server.stop().await
    }
}
