//! Configuration types for the imposter host.

mod cli;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::imposter::ImposterConfig;
use crate::lifecycle::AllowList;
use crate::proxy::ForwarderConfig;

pub use cli::{Cli, LogFormat};

pub const DEFAULT_PORT: u16 = 2525;
pub const DEFAULT_PROTOFILE: &str = "protocols.json";

/// Effective server options. Serialized as the `options` block of `/config`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    /// Admin API port
    pub port: u16,
    /// Admin API bind host; `0.0.0.0` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub local_only: bool,
    /// Extra addresses allowed to reach the admin API. Loopback is always allowed.
    pub ip_whitelist: Vec<String>,
    pub protofile: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configfile: Option<PathBuf>,
    pub allow_injection: bool,
    /// Record requests on every imposter
    pub mock: bool,
    #[serde(skip)]
    pub forwarder: ForwarderConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: None,
            local_only: false,
            ip_whitelist: vec!["*".to_string()],
            protofile: PathBuf::from(DEFAULT_PROTOFILE),
            configfile: None,
            allow_injection: false,
            mock: false,
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl ServerOptions {
    /// Host the admin listener binds to
    pub fn bind_host(&self) -> &str {
        if self.local_only {
            "127.0.0.1"
        } else {
            self.host.as_deref().unwrap_or("0.0.0.0")
        }
    }

    /// Admin allow-list: loopback forms followed by `ip_whitelist`
    pub fn allow_list(&self) -> AllowList {
        AllowList::with_loopback(self.ip_whitelist.iter().cloned())
    }
}

/// Imposters to create at startup (`--configfile`)
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ImpostersFile {
    #[serde(default)]
    pub imposters: Vec<ImposterConfig>,
}

impl ImpostersFile {
    /// Load from YAML or JSON. JSON parses as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        let file: ImpostersFile = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Invalid imposters file {}: {}", path.display(), e))?;
        Ok(file)
    }
}
