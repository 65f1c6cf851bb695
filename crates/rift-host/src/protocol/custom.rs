//! Operator-supplied protocols.
//!
//! A protofile maps protocol names to a command:
//!
//! ```json
//! { "foo": { "createCommand": "node foo-server.js" } }
//! ```
//!
//! Creating an imposter of such a protocol spawns the command with the
//! imposter configuration appended as a final JSON argument. The process
//! reports requests back through the admin API's `_requests` callback and
//! may print `{"port": n}` as its first line of output.

use super::{
    CapturedRequest, ImposterContext, ImposterServer, Protocol, ProtocolError, ProtocolMap,
    RequestBody, WireFormat,
};
use crate::imposter::{ImposterConfig, ImposterError};
use crate::lifecycle::LifecycleError;
use crate::proxy::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a freshly spawned protocol process has to print its metadata line.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while loading a protofile
#[derive(Debug, Error)]
pub enum RegistryLoadError {
    #[error("Cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} contains invalid JSON: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid custom protocol '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },
}

/// One protofile entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProtocolConfig {
    pub create_command: String,
}

/// Load the custom protocols named in `path`.
///
/// A missing file means no custom protocols. Entries that are not objects
/// with a string `createCommand` are skipped with a warning.
pub fn load_protofile(path: &Path) -> Result<ProtocolMap, RegistryLoadError> {
    if !path.exists() {
        debug!("No protofile at {}", path.display());
        return Ok(ProtocolMap::new());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| RegistryLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let entries: serde_json::Map<String, Value> =
        serde_json::from_str(&contents).map_err(|source| RegistryLoadError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    let mut protocols = ProtocolMap::new();
    for (name, entry) in entries {
        match ExternalProtocol::from_entry(&name, entry) {
            Ok(protocol) => {
                info!("Loaded custom protocol '{}'", name);
                protocols.insert(name, Arc::new(protocol));
            }
            Err(e) => warn!("{}", e),
        }
    }
    Ok(protocols)
}

/// A protocol implemented by an external process.
#[derive(Debug, Clone)]
pub struct ExternalProtocol {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ExternalProtocol {
    pub fn new(
        name: impl Into<String>,
        config: CustomProtocolConfig,
    ) -> Result<Self, RegistryLoadError> {
        let name = name.into();
        let mut parts = config.create_command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| RegistryLoadError::InvalidEntry {
            name: name.clone(),
            reason: "createCommand is empty".into(),
        })?;

        Ok(Self {
            name,
            program,
            args: parts.collect(),
        })
    }

    fn from_entry(name: &str, entry: Value) -> Result<Self, RegistryLoadError> {
        let config: CustomProtocolConfig =
            serde_json::from_value(entry).map_err(|e| RegistryLoadError::InvalidEntry {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Self::new(name, config)
    }

    /// Argument handed to the process: the imposter config plus the callback URL.
    fn launch_argument(
        &self,
        config: &ImposterConfig,
        context: &ImposterContext,
    ) -> Result<String, ImposterError> {
        let mut value =
            serde_json::to_value(config).map_err(|e| ImposterError::InvalidConfig(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "callbackURLTemplate".into(),
                Value::String(context.callback_url_template.clone()),
            );
        }
        Ok(value.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProtocolMetadata {
    port: Option<u16>,
}

/// Read the first JSON value on `line`, ignoring anything after it.
fn parse_metadata(line: &str) -> Option<ProtocolMetadata> {
    serde_json::Deserializer::from_str(line)
        .into_iter::<ProtocolMetadata>()
        .next()
        .and_then(Result::ok)
}

impl WireFormat for ExternalProtocol {
    fn format_request(
        &self,
        request: &CapturedRequest,
        _target: &Endpoint,
    ) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    fn parse_request(
        &self,
        raw: &[u8],
        request_from: &str,
    ) -> Result<CapturedRequest, ProtocolError> {
        let body: serde_json::Map<String, Value> = serde_json::from_slice(raw)
            .map_err(|e| ProtocolError::Malformed(format!("{} request: {e}", self.name)))?;
        Ok(CapturedRequest::new(request_from, RequestBody::Custom(body)))
    }
}

#[async_trait]
impl Protocol for ExternalProtocol {
    async fn start(
        &self,
        config: &ImposterConfig,
        context: ImposterContext,
    ) -> Result<Box<dyn ImposterServer>, ImposterError> {
        let argument = self.launch_argument(config, &context)?;

        debug!("Spawning {} for protocol '{}'", self.program, self.name);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(argument)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ImposterError::Start(format!("{}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ImposterError::Start("process stdout was not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let metadata = match tokio::time::timeout(METADATA_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => parse_metadata(&line).unwrap_or_default(),
            Ok(Ok(None)) => ProtocolMetadata::default(),
            Ok(Err(e)) => {
                warn!("Failed to read output of '{}': {}", self.name, e);
                ProtocolMetadata::default()
            }
            Err(_) => {
                debug!("'{}' printed no metadata within {:?}", self.name, METADATA_TIMEOUT);
                ProtocolMetadata::default()
            }
        };

        let Some(port) = metadata.port.or(config.port.filter(|p| *p != 0)) else {
            let _ = child.kill().await;
            return Err(ImposterError::Start(format!(
                "'{}' did not report a port and none was configured",
                self.name
            )));
        };

        let name = self.name.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{}:{}] {}", name, port, line);
            }
        });

        Ok(Box::new(ExternalServer {
            port,
            child: Mutex::new(Some(child)),
        }))
    }
}

/// Running protocol process
struct ExternalServer {
    port: u16,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl ImposterServer for ExternalServer {
    fn port(&self) -> u16 {
        self.port
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Protocol process on port {} already exited: {}", self.port, status);
            return Ok(());
        }

        child.kill().await.map_err(|e| LifecycleError::StopFailed {
            port: self.port,
            reason: e.to_string(),
        })
    }
}
