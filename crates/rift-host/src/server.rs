//! Process orchestration: wires the registry, imposters and admin API together.

use crate::admin_api::AdminApi;
use crate::config::{ImpostersFile, ServerOptions};
use crate::imposter::ImposterManager;
use crate::lifecycle::{ConnectionManager, LifecycleError};
use crate::protocol::{builtin_protocols, custom, ProtocolMap, ProtocolRegistry};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

/// Entry point for starting the host.
pub struct Server;

impl Server {
    /// Start the admin API and any configured imposters.
    pub async fn start(options: ServerOptions) -> anyhow::Result<ServerHandle> {
        let overrides = match custom::load_protofile(&options.protofile) {
            Ok(protocols) => protocols,
            Err(e) => {
                error!("{} -- no custom protocols loaded", e);
                ProtocolMap::new()
            }
        };
        let registry = Arc::new(ProtocolRegistry::load(
            builtin_protocols(options.forwarder),
            overrides,
        ));

        let host = options.bind_host();
        let listener = TcpListener::bind((host, options.port))
            .await
            .with_context(|| format!("Cannot bind admin API to {}:{}", host, options.port))?;
        let admin_addr = listener.local_addr()?;

        let callback_url_template = format!(
            "http://localhost:{}/imposters/:port/_requests",
            admin_addr.port()
        );
        let imposters = Arc::new(ImposterManager::new(
            registry,
            callback_url_template,
            options.mock,
        ));

        let admin = AdminApi::new(Arc::clone(&imposters), serde_json::to_value(&options)?);
        let connections =
            ConnectionManager::start(listener, options.allow_list(), Arc::new(admin))?;

        let handle = ServerHandle {
            admin_addr,
            connections,
            imposters,
            closed: OnceCell::new(),
        };

        if let Some(path) = &options.configfile {
            if let Err(e) = handle.create_from_file(path).await {
                if let Err(close_err) = handle.close().await {
                    warn!("Cleanup after failed startup: {}", close_err);
                }
                return Err(e);
            }
        }

        info!(
            "rift-host v{} now taking orders - point your browser to http://localhost:{} for help",
            env!("CARGO_PKG_VERSION"),
            admin_addr.port()
        );
        if options.allow_injection {
            warn!("Running with --allow-injection set. Anyone who can reach the admin API can run commands on this host.");
        }

        Ok(handle)
    }
}

/// A running host.
pub struct ServerHandle {
    admin_addr: SocketAddr,
    connections: Arc<ConnectionManager>,
    imposters: Arc<ImposterManager>,
    closed: OnceCell<Result<(), LifecycleError>>,
}

impl ServerHandle {
    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn imposters(&self) -> &Arc<ImposterManager> {
        &self.imposters
    }

    async fn create_from_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let file = ImpostersFile::from_file(path)?;
        for config in file.imposters {
            let port = config.port;
            self.imposters
                .create_imposter(config)
                .await
                .with_context(|| {
                    format!("Cannot create imposter {:?} from {}", port, path.display())
                })?;
        }
        Ok(())
    }

    /// Stop every imposter and the admin listener.
    ///
    /// Only the first call acts; later calls wait for it and return its result.
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let result = self
            .closed
            .get_or_init(|| async {
                let (_, shutdown) =
                    tokio::join!(self.imposters.delete_all(), self.connections.shutdown());
                info!("Adios - see you soon?");
                shutdown
            })
            .await;

        result.clone()
    }
}
