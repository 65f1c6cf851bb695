//! Per-listener connection registry with forced-close shutdown.

use super::{socket_name, AllowList, LifecycleError};
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::SockRef;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff after a failed accept (e.g. EMFILE) so the loop does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Serves one admitted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

struct TrackedConnection {
    generation: u64,
    /// Duplicate of the connection's socket, used only to force it closed.
    control: std::net::TcpStream,
}

/// Owns a listener and every connection it admitted.
pub struct ConnectionManager {
    local_addr: SocketAddr,
    allow_list: AllowList,
    connections: Mutex<HashMap<String, TrackedConnection>>,
    next_generation: AtomicU64,
    accepting: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: OnceCell<Result<(), LifecycleError>>,
    idle: Notify,
}

impl ConnectionManager {
    /// Take ownership of `listener` and start accepting.
    pub fn start(
        listener: TcpListener,
        allow_list: AllowList,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let manager = Arc::new(Self {
            local_addr,
            allow_list,
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            accepting: CancellationToken::new(),
            accept_task: Mutex::new(None),
            closed: OnceCell::new(),
            idle: Notify::new(),
        });

        let task = tokio::spawn(accept_loop(
            Arc::downgrade(&manager),
            listener,
            manager.accepting.clone(),
            handler,
        ));
        *manager.accept_task.lock() = Some(task);

        Ok(manager)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of admitted connections that have not closed yet.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Admission check and registration for a freshly accepted connection.
    ///
    /// Runs on the accept loop before the connection's task is spawned. A
    /// rejected peer has its stream dropped without a byte written. An
    /// admitted connection is returned with the guard that unregisters it.
    pub fn on_accept(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Option<(TcpStream, ConnectionGuard)> {
        if !self.allow_list.is_allowed_addr(peer.ip()) {
            warn!(
                "Blocking incoming connection from {}. Add to --ip-whitelist to allow",
                peer.ip()
            );
            return None;
        }

        let id = socket_name(&peer);
        let (stream, control) = match split_control(stream) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Dropping connection from {}: {}", id, e);
                return None;
            }
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut connections = self.connections.lock();
            // shutdown() cancels before taking this lock, so a connection
            // accepted concurrently is either in its snapshot or closed here
            if self.accepting.is_cancelled() {
                force_close(&control);
                return None;
            }
            connections.insert(id.clone(), TrackedConnection { generation, control });
        }
        debug!("Connection from {} registered on {}", id, self.local_addr);

        Some((
            stream,
            ConnectionGuard {
                manager: Arc::clone(self),
                id,
                generation,
            },
        ))
    }

    /// Stop accepting and force-close every tracked connection.
    ///
    /// Resolves once the accept task has exited and released the listener.
    /// Only the first call acts; every caller waits for it and gets its result.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.closed.get_or_init(|| self.close_listener()).await.clone()
    }

    async fn close_listener(&self) -> Result<(), LifecycleError> {
        self.accepting.cancel();

        let closed = {
            let connections = self.connections.lock();
            for connection in connections.values() {
                force_close(&connection.control);
            }
            connections.len()
        };
        if closed > 0 {
            info!("Closed {} open connection(s) on {}", closed, self.local_addr);
        }

        let task = self.accept_task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        task.await.map_err(|e| {
            error!("Listener on {} failed to close: {}", self.local_addr, e);
            LifecycleError::ListenerFailed {
                addr: self.local_addr,
                reason: e.to_string(),
            }
        })
    }

    /// Resolve once no admitted connection remains open.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.connections.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.accepting.cancel();
    }
}

/// Unregisters a connection when its task finishes.
pub struct ConnectionGuard {
    manager: Arc<ConnectionManager>,
    id: String,
    generation: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut connections = self.manager.connections.lock();
        // a reused identity belongs to a newer connection
        if connections
            .get(&self.id)
            .is_some_and(|c| c.generation == self.generation)
        {
            connections.remove(&self.id);
        }
        if connections.is_empty() {
            self.manager.idle.notify_waiters();
        }
    }
}

async fn accept_loop(
    manager: Weak<ConnectionManager>,
    listener: TcpListener,
    accepting: CancellationToken,
    handler: Arc<dyn ConnectionHandler>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = accepting.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Some((stream, guard)) = manager.on_accept(stream, peer) {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        handler.handle(stream, peer).await;
                        drop(guard);
                    });
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    if let Ok(addr) = listener.local_addr() {
        debug!("Stopped accepting on {}", addr);
    }
}

/// Split off a duplicate socket handle that can close the connection from
/// outside its task.
fn split_control(stream: TcpStream) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let control = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, control))
}

/// Abort the connection without waiting for the peer.
fn force_close(control: &std::net::TcpStream) {
    let socket = SockRef::from(control);
    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        debug!("Failed to set SO_LINGER: {}", e);
    }
    if let Err(e) = control.shutdown(Shutdown::Both) {
        debug!("Failed to shut down socket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr) {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn start_echo(allow_list: AllowList) -> Arc<ConnectionManager> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ConnectionManager::start(listener, allow_list, Arc::new(Echo)).unwrap()
    }

    async fn wait_for_connections(manager: &ConnectionManager, expected: usize) {
        for _ in 0..100 {
            if manager.active_connections() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} connections, found {}",
            expected,
            manager.active_connections()
        );
    }

    #[tokio::test]
    async fn test_admitted_connection_is_tracked_until_close() {
        let manager = start_echo(AllowList::with_loopback(Vec::<String>::new())).await;

        let mut client = TcpStream::connect(manager.local_addr()).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(manager.active_connections(), 1);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), manager.wait_idle())
            .await
            .unwrap();
        assert_eq!(manager.active_connections(), 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_peer_sees_close_without_bytes() {
        let manager = start_echo(AllowList::new(["10.0.0.9"])).await;

        let mut client = TcpStream::connect(manager.local_addr()).await.unwrap();
        let _ = client.write_all(b"hello").await;
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .unwrap();
        // either a clean EOF or a reset, but never data
        if read.is_ok() {
            assert!(buf.is_empty());
        }
        assert_eq!(manager.active_connections(), 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let manager = start_echo(AllowList::any()).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(manager.local_addr()).await.unwrap());
        }
        wait_for_connections(&manager, 3).await;

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
            .await
            .unwrap()
            .unwrap();

        for client in &mut clients {
            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        tokio::time::timeout(Duration::from_secs(2), manager.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = start_echo(AllowList::any()).await;
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_waits_for_listener() {
        let manager = start_echo(AllowList::any()).await;
        let addr = manager.local_addr();

        let second = async {
            let result = manager.shutdown().await;
            (result, TcpStream::connect(addr).await.is_err())
        };
        let (first, (second, released)) = tokio::join!(manager.shutdown(), second);

        first.unwrap();
        second.unwrap();
        assert!(released, "second caller returned before the listener closed");
    }

    #[tokio::test]
    async fn test_listener_released_after_shutdown() {
        let manager = start_echo(AllowList::any()).await;
        let addr = manager.local_addr();
        manager.shutdown().await.unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
