//! loopwire Server
//!
//! Accepts connections on a TCP loopback port or a Unix socket and keeps a
//! map of live connections. A connection is removed from the map as soon as
//! it closes, whichever side closed it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use super::{
    BaseListener, Connection, ConnectionError, ConnectionHandle, ConnectionId, ListenerRegistry,
    NetworkConfig, PacketHandler, PeerAddr, Side, TransportKind, TransportListener,
};
use crate::protocol::Packet;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, Connection>>>;

/// Delay before accepting again after an accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// loopwire Server
pub struct Server {
    config: NetworkConfig,
    registry: Arc<ListenerRegistry>,
    connections: ConnectionMap,
    local_addr: PeerAddr,
    socket_path: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Server {
    /// Listen on the configured loopback port (0 picks a free one)
    pub async fn bind_tcp(config: NetworkConfig) -> ServerResult<Self> {
        let listener = TransportListener::bind_tcp(config.port)
            .await
            .map_err(|e| ServerError::BindFailed(format!("localhost:{}", config.port), e))?;
        Self::start(listener, config)
    }

    pub fn bind_unix(path: impl AsRef<Path>, config: NetworkConfig) -> ServerResult<Self> {
        let path = path.as_ref();
        let listener = TransportListener::bind_unix(path)
            .map_err(|e| ServerError::BindFailed(path.display().to_string(), e))?;
        Self::start(listener, config)
    }

    /// Listen using the configured transport
    pub async fn bind(config: NetworkConfig, app_name: &str) -> ServerResult<Self> {
        match config.transport {
            TransportKind::Tcp => Self::bind_tcp(config).await,
            TransportKind::Unix => {
                let path = config.resolve_socket_path(app_name);
                Self::bind_unix(path, config)
            }
        }
    }

    /// Start accepting on an already bound listener
    pub fn start(listener: TransportListener, config: NetworkConfig) -> ServerResult<Self> {
        let local_addr = listener.local_addr()?;
        let socket_path = listener.socket_path().map(Path::to_path_buf);

        let registry = Arc::new(ListenerRegistry::new());
        BaseListener::new(Side::Server {
            platform: config.platform.clone(),
            version: config.protocol_version,
        })
        .install(&registry);

        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!("Server listening on {}", local_addr);

        tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            connections.clone(),
            shutdown_rx,
            config.max_frame_size,
        ));

        Ok(Self {
            config,
            registry,
            connections,
            local_addr,
            socket_path,
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.local_addr
    }

    /// Bound TCP port, if listening on TCP
    pub fn port(&self) -> Option<u16> {
        match self.local_addr {
            PeerAddr::Tcp(addr) => Some(addr.port()),
            PeerAddr::Unix(_) => None,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Handles of all live connections
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections
            .read()
            .await
            .values()
            .map(|connection| connection.handle().clone())
            .collect()
    }

    /// Send to a single connection
    pub async fn send_to(&self, id: ConnectionId, packet: Packet) -> ServerResult<()> {
        let handle = self
            .connections
            .read()
            .await
            .get(&id)
            .map(|connection| connection.handle().clone())
            .ok_or(ConnectionError::Closed)?;
        handle.send(packet).await?;
        Ok(())
    }

    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(true);
        self.registry.release_pending();
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Could not remove {}: {}", path.display(), e);
            }
        }
        true
    }
}

#[async_trait]
impl PacketHandler for Server {
    fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Broadcast to every live connection. A connection that fails is
    /// logged and closed; the others still get the packet.
    async fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        for handle in self.connections().await {
            if let Err(e) = handle.send(packet.clone()).await {
                tracing::warn!("Broadcast to {} failed: {}", handle.peer_addr(), e);
                handle.close();
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.shutdown() {
            return;
        }
        let drained: Vec<Connection> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        tracing::info!(
            "Server on {} closed ({} connections dropped)",
            self.local_addr,
            drained.len()
        );
        drop(drained);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.shutdown() {
            if let Ok(mut connections) = self.connections.try_write() {
                connections.clear();
            }
        }
    }
}

async fn accept_loop(
    listener: TransportListener,
    registry: Arc<ListenerRegistry>,
    connections: ConnectionMap,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let transport = match accepted {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let connection = match Connection::spawn(transport, registry.clone(), max_frame_size) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("Failed to set up accepted connection: {}", e);
                continue;
            }
        };

        let handle = connection.handle().clone();
        {
            let mut map = connections.write().await;
            if *shutdown_rx.borrow() {
                break;
            }
            map.insert(handle.id(), connection);
        }

        let connections = connections.clone();
        tokio::spawn(async move {
            handle.closed().await;
            if connections.write().await.remove(&handle.id()).is_some() {
                tracing::debug!("Removed connection {} ({})", handle.id(), handle.peer_addr());
            }
        });
    }

    tracing::info!("Server shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::bind_tcp(NetworkConfig::new(0)).await.unwrap();
        assert!(server.port().unwrap() > 0);
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_failure_names_address() {
        let first = Server::bind_tcp(NetworkConfig::new(0)).await.unwrap();
        let port = first.port().unwrap();
        match Server::bind_tcp(NetworkConfig::new(port)).await {
            Err(ServerError::BindFailed(addr, _)) => {
                assert_eq!(addr, format!("localhost:{}", port))
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind on the same port succeeded"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = Server::bind_tcp(NetworkConfig::new(0)).await.unwrap();
        server.close().await;
        server.close().await;
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_without_connections() {
        let server = Server::bind_tcp(NetworkConfig::new(0)).await.unwrap();
        server.send(Packet::handshake()).await.unwrap();
    }
}
