//! Command-line options.

use super::{ServerOptions, DEFAULT_PORT, DEFAULT_PROTOFILE};
use crate::proxy::ForwarderConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "rift-host",
    version,
    about = "Multi-protocol imposter host with a Mountebank-compatible admin API"
)]
pub struct Cli {
    /// Admin API port
    #[arg(long, env = "RIFT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Admin API bind host (default: all interfaces)
    #[arg(long, env = "RIFT_HOST")]
    pub host: Option<String>,

    /// Only accept admin connections on the loopback interface
    #[arg(long, env = "RIFT_LOCAL_ONLY")]
    pub local_only: bool,

    /// Addresses allowed to reach the admin API, repeatable or '|'-separated
    #[arg(
        long,
        env = "RIFT_IP_WHITELIST",
        value_delimiter = '|',
        default_value = "*"
    )]
    pub ip_whitelist: Vec<String>,

    /// JSON file of custom protocols
    #[arg(long, env = "RIFT_PROTOFILE", default_value = DEFAULT_PROTOFILE)]
    pub protofile: PathBuf,

    /// YAML or JSON file of imposters to create at startup
    #[arg(long, env = "RIFT_CONFIGFILE")]
    pub configfile: Option<PathBuf>,

    #[arg(long, env = "RIFT_ALLOW_INJECTION")]
    pub allow_injection: bool,

    /// Record requests on every imposter
    #[arg(long, env = "RIFT_MOCK")]
    pub mock: bool,

    #[arg(long, env = "RIFT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "RIFT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(long, env = "RIFT_PROXY_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub proxy_connect_timeout_ms: u64,

    #[arg(long, env = "RIFT_PROXY_IDLE_TIMEOUT_MS", default_value_t = 1_000)]
    pub proxy_idle_timeout_ms: u64,
}

impl Cli {
    pub fn into_options(self) -> ServerOptions {
        ServerOptions {
            port: self.port,
            host: self.host,
            local_only: self.local_only,
            ip_whitelist: self
                .ip_whitelist
                .into_iter()
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect(),
            protofile: self.protofile,
            configfile: self.configfile,
            allow_injection: self.allow_injection,
            mock: self.mock,
            forwarder: ForwarderConfig {
                connect_timeout: Duration::from_millis(self.proxy_connect_timeout_ms),
                idle_timeout: Duration::from_millis(self.proxy_idle_timeout_ms),
            },
        }
    }
}
