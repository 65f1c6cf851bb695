//! Shared helpers for the integration tests.

#![allow(dead_code)]

use reqwest::Client;
use rift_host::{Server, ServerHandle, ServerOptions};
use serde_json::Value;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A host on an OS-chosen loopback port with no protofile.
pub struct TestHost {
    pub handle: ServerHandle,
    pub client: Client,
    pub base_url: String,
    // keeps the protofile directory alive
    _dir: TempDir,
}

impl TestHost {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(customize: impl FnOnce(&mut ServerOptions)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut options = ServerOptions {
            port: 0,
            host: Some("127.0.0.1".to_string()),
            protofile: dir.path().join("protocols.json"),
            ..Default::default()
        };
        customize(&mut options);

        let handle = Server::start(options).await.unwrap();
        let base_url = format!("http://127.0.0.1:{}", handle.admin_addr().port());
        Self {
            handle,
            client: Client::builder().timeout(TEST_TIMEOUT).build().unwrap(),
            base_url,
            _dir: dir,
        }
    }

    /// POST an imposter and return its port.
    pub async fn create(&self, config: Value) -> u16 {
        let resp = self
            .client
            .post(format!("{}/imposters", self.base_url))
            .json(&config)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201, "create failed for {config}");
        let body: Value = resp.json().await.unwrap();
        body["port"].as_u64().unwrap() as u16
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    pub async fn delete(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}
