//! System handlers: root links and config.

use crate::admin_api::server::AdminState;
use crate::admin_api::types::*;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// GET / - Root endpoint (Mountebank-compatible format)
pub fn handle_root(base_url: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "_links": {
            "imposters": {"href": format!("{}/imposters", base_url)},
            "config": {"href": format!("{}/config", base_url)}
        }
    });
    json_response(StatusCode::OK, &body)
}

/// GET /config - Mountebank-compatible config endpoint
pub fn handle_config(state: &AdminState) -> Response<Full<Bytes>> {
    let config = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "options": state.options,
        "protocols": state.manager.registry().names(),
        "process": {
            "architecture": std::env::consts::ARCH,
            "platform": std::env::consts::OS,
            "uptime": state.started_at.elapsed().as_secs(),
            "cwd": std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        }
    });
    json_response(StatusCode::OK, &config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imposter::ImposterManager;
    use crate::protocol::{builtin_protocols, ProtocolMap, ProtocolRegistry};
    use crate::proxy::ForwarderConfig;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_handle_root() {
        let resp = handle_root("http://localhost:2525");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_handle_config() {
        let registry = ProtocolRegistry::load(
            builtin_protocols(ForwarderConfig::default()),
            ProtocolMap::new(),
        );
        let state = AdminState {
            manager: Arc::new(ImposterManager::new(Arc::new(registry), "", false)),
            options: serde_json::json!({"port": 2525}),
            started_at: Instant::now(),
        };

        let resp = handle_config(&state);
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["options"]["port"], 2525);
        assert_eq!(
            body["protocols"],
            serde_json::json!(["http", "https", "smtp", "tcp"])
        );
    }
}
