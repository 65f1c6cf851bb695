//! Tests for the imposter module.
//!
//! Covers configuration parsing, the response plan, the request log and the
//! ImposterManager lifecycle against real listeners.

use super::*;
use crate::protocol::tcp::TcpMode;
use crate::protocol::{
    builtin_protocols, CapturedRequest, ProtocolMap, ProtocolRegistry, RequestBody, TcpRequest,
};
use crate::proxy::{Endpoint, ForwarderConfig};
use serde_json::json;
use std::sync::Arc;

fn manager(record_all: bool) -> ImposterManager {
    let registry = ProtocolRegistry::load(
        builtin_protocols(ForwarderConfig::default()),
        ProtocolMap::new(),
    );
    ImposterManager::new(
        Arc::new(registry),
        "http://localhost:2525/imposters/:port/_requests",
        record_all,
    )
}

fn local(protocol: &str) -> ImposterConfig {
    ImposterConfig {
        protocol: protocol.to_string(),
        host: Some("127.0.0.1".to_string()),
        ..Default::default()
    }
}

fn tcp_request(data: &str) -> CapturedRequest {
    CapturedRequest::new(
        "127.0.0.1:40000",
        RequestBody::Tcp(TcpRequest {
            data: data.to_string(),
        }),
    )
}

#[test]
fn test_imposter_config_default() {
    let json = r#"{"port": 8080}"#;
    let config: ImposterConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.port, Some(8080));
    assert_eq!(config.protocol, "http");
    assert!(!config.record_requests);
    assert!(config.stubs.is_empty());
    assert_eq!(config.tcp_mode(), TcpMode::Text);
}

#[test]
fn test_imposter_config_round_trips_stubs() {
    let json = json!({
        "port": 4545,
        "protocol": "tcp",
        "mode": "binary",
        "recordRequests": true,
        "stubs": [{
            "predicates": [{"contains": {"data": "AQI="}}],
            "responses": [{"is": {"data": "AwQ="}}]
        }],
        "defaultResponse": {"data": "BQY="}
    });
    let config: ImposterConfig = serde_json::from_value(json.clone()).unwrap();
    assert_eq!(config.tcp_mode(), TcpMode::Binary);
    assert_eq!(serde_json::to_value(&config).unwrap(), json);
}

#[test]
fn test_response_plan_proxy() {
    let config: ImposterConfig = serde_json::from_value(json!({
        "protocol": "tcp",
        "stubs": [{"responses": [{"proxy": {"to": "tcp://localhost:5555"}}]}]
    }))
    .unwrap();

    match config.response_plan().unwrap() {
        ResponsePlan::Proxy(endpoint) => {
            assert_eq!(endpoint, Endpoint::new("localhost", 5555));
        }
        other => panic!("unexpected plan {other:?}"),
    }
}

#[test]
fn test_response_plan_skips_stubs_with_predicates() {
    let config: ImposterConfig = serde_json::from_value(json!({
        "stubs": [
            {
                "predicates": [{"equals": {"path": "/x"}}],
                "responses": [{"is": {"statusCode": 404}}]
            },
            {"responses": [{"is": {"statusCode": 201}}, {"is": {"statusCode": 500}}]}
        ]
    }))
    .unwrap();

    assert_eq!(
        config.response_plan().unwrap(),
        ResponsePlan::Is(json!({"statusCode": 201}))
    );
}

#[test]
fn test_response_plan_default() {
    let config: ImposterConfig = serde_json::from_value(json!({
        "stubs": [{"predicates": [{"equals": {"path": "/x"}}], "responses": [{"is": {}}]}],
        "defaultResponse": {"statusCode": 400}
    }))
    .unwrap();
    assert_eq!(
        config.response_plan().unwrap(),
        ResponsePlan::Default(Some(json!({"statusCode": 400})))
    );

    assert_eq!(
        ImposterConfig::default().response_plan().unwrap(),
        ResponsePlan::Default(None)
    );
}

#[test]
fn test_response_plan_bad_proxy() {
    let missing_to: ImposterConfig = serde_json::from_value(json!({
        "stubs": [{"responses": [{"proxy": {}}]}]
    }))
    .unwrap();
    assert!(matches!(
        missing_to.response_plan(),
        Err(ImposterError::InvalidConfig(_))
    ));

    let bad_url: ImposterConfig = serde_json::from_value(json!({
        "stubs": [{"responses": [{"proxy": {"to": "not a url"}}]}]
    }))
    .unwrap();
    assert!(matches!(
        bad_url.response_plan(),
        Err(ImposterError::InvalidConfig(_))
    ));
}

#[test]
fn test_request_log_counts_without_recording() {
    let log = RequestLog::new(false);
    log.record(tcp_request("a"));
    log.record(tcp_request("b"));

    assert!(!log.is_recording());
    assert_eq!(log.count(), 2);
    assert!(log.requests().is_empty());
}

#[test]
fn test_request_log_records_and_clears() {
    let log = RequestLog::new(true);
    log.record(tcp_request("a"));
    log.record(tcp_request("b"));

    let requests = log.requests();
    assert_eq!(requests.len(), 2);
    assert!(matches!(&requests[1].body, RequestBody::Tcp(r) if r.data == "b"));

    log.clear();
    assert_eq!(log.count(), 0);
    assert!(log.requests().is_empty());
}

#[test]
fn test_error_codes() {
    assert_eq!(ImposterError::PortInUse(1).code(), "resource conflict");
    assert_eq!(ImposterError::NotFound(1).code(), "no such resource");
    assert_eq!(
        ImposterError::InvalidProtocol("gopher".into()).code(),
        "bad data"
    );
    assert_eq!(ImposterError::Start("x".into()).code(), "internal error");
}

#[tokio::test]
async fn test_manager_create_and_delete() {
    let manager = manager(false);

    let mut config = local("tcp");
    config.name = Some("echo".to_string());
    let port = manager.create_imposter(config).await.unwrap();
    assert_ne!(port, 0);
    assert_eq!(manager.count(), 1);

    let imposter = manager.get_imposter(port).unwrap();
    assert_eq!(imposter.protocol(), "tcp");
    assert_eq!(imposter.config.port, Some(port));
    assert_eq!(imposter.config.name.as_deref(), Some("echo"));

    let deleted = manager.delete_imposter(port).await.unwrap();
    assert_eq!(deleted.port, port);
    assert_eq!(manager.count(), 0);

    // listener is gone
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err());
}

#[tokio::test]
async fn test_manager_port_in_use() {
    let manager = manager(false);
    let port = manager.create_imposter(local("tcp")).await.unwrap();

    let mut duplicate = local("http");
    duplicate.port = Some(port);
    assert!(matches!(
        manager.create_imposter(duplicate).await,
        Err(ImposterError::PortInUse(p)) if p == port
    ));
    assert_eq!(manager.count(), 1);

    manager.delete_all().await;
}

#[tokio::test]
async fn test_manager_concurrent_create_same_port() {
    let manager = manager(false);
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = || {
        let mut config = local("tcp");
        config.port = Some(port);
        config
    };

    let (first, second) = tokio::join!(
        manager.create_imposter(config()),
        manager.create_imposter(config())
    );
    let created: Vec<u16> = [&first, &second]
        .into_iter()
        .filter_map(|r| r.as_ref().ok().copied())
        .collect();
    assert_eq!(created, vec![port]);
    assert!(first.is_err() || second.is_err());
    assert_eq!(manager.count(), 1);
    assert_eq!(manager.get_imposter(port).unwrap().port, port);

    manager.delete_all().await;
}

#[tokio::test]
async fn test_manager_unknown_protocol() {
    let manager = manager(false);
    assert!(matches!(
        manager.create_imposter(local("gopher")).await,
        Err(ImposterError::InvalidProtocol(name)) if name == "gopher"
    ));
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_manager_delete_missing() {
    let manager = manager(false);
    assert!(matches!(
        manager.delete_imposter(1).await,
        Err(ImposterError::NotFound(1))
    ));
    assert!(matches!(
        manager.get_imposter(1),
        Err(ImposterError::NotFound(1))
    ));
}

#[tokio::test]
async fn test_manager_list_and_delete_all() {
    let manager = manager(true);
    let mut ports = vec![
        manager.create_imposter(local("tcp")).await.unwrap(),
        manager.create_imposter(local("http")).await.unwrap(),
        manager.create_imposter(local("smtp")).await.unwrap(),
    ];
    ports.sort_unstable();

    let listed: Vec<u16> = manager.list_imposters().iter().map(|i| i.port).collect();
    assert_eq!(listed, ports);
    // mock mode records regardless of config
    assert!(manager.list_imposters().iter().all(|i| i.requests.is_recording()));

    let removed: Vec<u16> = manager.delete_all().await.iter().map(|i| i.port).collect();
    assert_eq!(removed, ports);
    assert_eq!(manager.count(), 0);
    assert!(manager.delete_all().await.is_empty());
}
