//! ImposterManager - lifecycle management for multiple imposters.
//!
//! This module handles creating, deleting, and managing multiple imposters,
//! each running on its own port.

use super::core::{Imposter, RequestLog};
use super::types::{ImposterConfig, ImposterError};
use crate::protocol::{ImposterContext, ProtocolRegistry};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Manages the lifecycle of multiple imposters
pub struct ImposterManager {
    /// Active imposters by port
    imposters: RwLock<HashMap<u16, Arc<Imposter>>>,
    registry: Arc<ProtocolRegistry>,
    /// `_requests` callback URL for out-of-process protocols
    callback_url_template: String,
    /// Record requests on every imposter regardless of its config
    record_all: bool,
}

impl ImposterManager {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        callback_url_template: impl Into<String>,
        record_all: bool,
    ) -> Self {
        Self {
            imposters: RwLock::new(HashMap::new()),
            registry,
            callback_url_template: callback_url_template.into(),
            record_all,
        }
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Create and start an imposter
    /// Returns the bound port (which the OS picked if the config did not name one)
    pub async fn create_imposter(&self, config: ImposterConfig) -> Result<u16, ImposterError> {
        if let Some(port) = config.port.filter(|p| *p != 0) {
            if self.imposters.read().contains_key(&port) {
                return Err(ImposterError::PortInUse(port));
            }
        }

        let protocol = self.registry.resolve(&config.protocol)?;
        let requests = Arc::new(RequestLog::new(config.record_requests || self.record_all));
        let context = ImposterContext {
            requests: Arc::clone(&requests),
            callback_url_template: self.callback_url_template.clone(),
        };

        let server = protocol.start(&config, context).await?;
        let imposter = Arc::new(Imposter::new(config, requests, server));
        let port = imposter.port;

        // a concurrent create may have claimed the port since the check above
        let rejected = {
            let mut imposters = self.imposters.write();
            if imposters.contains_key(&port) {
                Some(Arc::clone(&imposter))
            } else {
                imposters.insert(port, Arc::clone(&imposter));
                None
            }
        };
        if let Some(duplicate) = rejected {
            if let Err(e) = duplicate.stop().await {
                warn!("Failed to stop duplicate imposter on port {}: {}", port, e);
            }
            return Err(ImposterError::PortInUse(port));
        }

        info!(
            "{} imposter{} open for business on port {}",
            imposter.protocol(),
            imposter
                .config
                .name
                .as_deref()
                .map(|n| format!(" '{n}'"))
                .unwrap_or_default(),
            port
        );
        Ok(port)
    }

    /// Delete an imposter, stopping its server
    pub async fn delete_imposter(&self, port: u16) -> Result<Arc<Imposter>, ImposterError> {
        let imposter = {
            let mut imposters = self.imposters.write();
            imposters
                .remove(&port)
                .ok_or(ImposterError::NotFound(port))?
        };

        imposter.stop().await?;
        info!("Imposter on port {} deleted", port);
        Ok(imposter)
    }

    /// Get an imposter by port
    pub fn get_imposter(&self, port: u16) -> Result<Arc<Imposter>, ImposterError> {
        let imposters = self.imposters.read();
        imposters
            .get(&port)
            .cloned()
            .ok_or(ImposterError::NotFound(port))
    }

    /// List all imposters, ordered by port
    pub fn list_imposters(&self) -> Vec<Arc<Imposter>> {
        let mut imposters: Vec<_> = self.imposters.read().values().cloned().collect();
        imposters.sort_by_key(|imposter| imposter.port);
        imposters
    }

    /// Delete all imposters, stopping their servers concurrently
    pub async fn delete_all(&self) -> Vec<Arc<Imposter>> {
        let removed: Vec<Arc<Imposter>> = {
            let mut imposters = self.imposters.write();
            let mut removed: Vec<_> = imposters.drain().map(|(_, imposter)| imposter).collect();
            removed.sort_by_key(|imposter| imposter.port);
            removed
        };

        let results = join_all(removed.iter().map(|imposter| imposter.stop())).await;
        for (imposter, result) in removed.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop imposter on port {}: {}", imposter.port, e);
            }
        }

        removed
    }

    pub fn count(&self) -> usize {
        self.imposters.read().len()
    }
}
