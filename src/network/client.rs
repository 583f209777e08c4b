//! loopwire client
//!
//! Owns a single connection to a server and drives the handshake.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::{
    BaseListener, Connection, ConnectionError, ConnectionHandle, ListenerRegistry, NetworkConfig,
    PacketHandler, PeerAddr, Side, Transport, Wait,
};
use crate::protocol::{Packet, PacketBody, PacketType};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(Duration),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Transport established, no handshake yet
    Connected,
    Handshaking,
    Ready,
    Refused,
}

/// Result of a completed handshake. A refusal is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Accepted,
    Refused(String),
}

impl HandshakeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandshakeOutcome::Accepted)
    }

    pub fn refusal(&self) -> Option<&str> {
        match self {
            HandshakeOutcome::Accepted => None,
            HandshakeOutcome::Refused(reason) => Some(reason),
        }
    }
}

/// loopwire client
pub struct Client {
    config: NetworkConfig,
    connection: Connection,
    registry: Arc<ListenerRegistry>,
    state: Arc<RwLock<ClientState>>,
    /// Serializes handshakes
    handshake_lock: Mutex<()>,
}

impl Client {
    /// Connect to a TCP server on the loopback interface
    pub async fn connect_tcp(port: u16, config: NetworkConfig) -> ClientResult<Self> {
        let transport = tokio::time::timeout(config.connect_timeout(), Transport::connect_tcp(port))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        Ok(Self::from_transport(transport, config)?)
    }

    pub async fn connect_unix(path: impl AsRef<Path>, config: NetworkConfig) -> ClientResult<Self> {
        let connect = Transport::connect_unix(path);
        let transport = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        Ok(Self::from_transport(transport, config)?)
    }

    /// Connect using the configured transport
    pub async fn connect(config: NetworkConfig, app_name: &str) -> ClientResult<Self> {
        match config.transport {
            super::TransportKind::Tcp => Self::connect_tcp(config.port, config).await,
            super::TransportKind::Unix => {
                let path = config.resolve_socket_path(app_name);
                Self::connect_unix(path, config).await
            }
        }
    }

    /// Wrap an established transport: install the base listener, then start
    /// the connection tasks.
    pub fn from_transport(transport: Transport, config: NetworkConfig) -> std::io::Result<Self> {
        let registry = Arc::new(ListenerRegistry::new());
        BaseListener::new(Side::Client).install(&registry);

        let connection = Connection::spawn(transport, registry.clone(), config.max_frame_size)?;
        let state = Arc::new(RwLock::new(ClientState::Connected));

        let handle = connection.handle().clone();
        let watched_state = state.clone();
        let watched_registry = registry.clone();
        tokio::spawn(async move {
            handle.closed().await;
            *watched_state.write().await = ClientState::Disconnected;
            watched_registry.release_pending();
        });

        tracing::info!("Connected to {}", connection.handle().peer_addr());

        Ok(Self {
            config,
            connection,
            registry,
            state,
            handshake_lock: Mutex::new(()),
        })
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn connection(&self) -> &ConnectionHandle {
        self.connection.handle()
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        self.connection.handle().peer_addr()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Send HANDSHAKE and wait for the server's confirmation or refusal.
    /// No reply within the handshake timeout is an error, not a refusal, and
    /// a connection lost while waiting is a connection error.
    pub async fn handshake(&self) -> ClientResult<HandshakeOutcome> {
        let _serialized = self.handshake_lock.lock().await;
        *self.state.write().await = ClientState::Handshaking;

        let timeout = self.config.handshake_timeout();
        let request = Packet::with_version(self.config.protocol_version, PacketBody::Handshake);
        let reply = self
            .exchange(
                request,
                |reply| {
                    matches!(
                        reply.packet_type(),
                        PacketType::HandshakeConfirm | PacketType::HandshakeRefuse
                    )
                },
                Wait::Within(timeout),
            )
            .await;

        let (next, result) = match reply {
            Ok(Some(packet)) => match packet.into_body() {
                PacketBody::HandshakeRefuse { reason } => {
                    tracing::debug!("Handshake refused: {}", reason);
                    (ClientState::Refused, Ok(HandshakeOutcome::Refused(reason)))
                }
                _ => {
                    tracing::debug!("Handshake accepted by {}", self.peer_addr());
                    (ClientState::Ready, Ok(HandshakeOutcome::Accepted))
                }
            },
            Ok(None) if self.is_closed() => (
                ClientState::Disconnected,
                Err(ConnectionError::Closed.into()),
            ),
            Ok(None) => (ClientState::Connected, Err(ClientError::HandshakeTimeout(timeout))),
            Err(e) => (ClientState::Connected, Err(e.into())),
        };

        let next = if self.is_closed() {
            ClientState::Disconnected
        } else {
            next
        };
        *self.state.write().await = next;
        result
    }

    /// Round trip time of a ping, bounded by the configured ping timeout
    pub async fn ping(&self) -> ClientResult<Duration> {
        Ok(self.poll_ping(Wait::Within(self.config.ping_timeout())).await?)
    }
}

#[async_trait]
impl PacketHandler for Client {
    fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    async fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.connection.handle().send(packet).await
    }

    async fn close(&self) {
        self.connection.handle().close();
        self.registry.release_pending();
        *self.state.write().await = ClientState::Disconnected;
    }

    fn is_closed(&self) -> bool {
        self.connection.handle().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TransportListener;
    use crate::protocol::{read_frame, MAX_FRAME_SIZE};

    #[tokio::test]
    async fn test_connect_refused() {
        let port = crate::network::discover_open_port().await.unwrap();
        let result = Client::connect_tcp(port, NetworkConfig::new(port)).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout_without_server_listener() {
        // A bare socket that accepts but never answers
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        let mut config = NetworkConfig::new(port);
        config.handshake_timeout_ms = 50;

        let (accepted, client) = tokio::join!(listener.accept(), Client::connect_tcp(port, config));
        let _peer = accepted.unwrap();
        let client = client.unwrap();
        assert_eq!(client.state().await, ClientState::Connected);

        let result = client.handshake().await;
        assert!(matches!(result, Err(ClientError::HandshakeTimeout(_))));
        assert_eq!(client.state().await, ClientState::Connected);
        assert_eq!(client.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_close_sets_disconnected() {
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        let connect = Client::connect_tcp(port, NetworkConfig::new(port));
        let (accepted, client) = tokio::join!(listener.accept(), connect);
        let _peer = accepted.unwrap();
        let client = client.unwrap();

        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_reports_lost_connection() {
        // Reads the HANDSHAKE, then hangs up without answering
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        let mut config = NetworkConfig::new(port);
        config.handshake_timeout_ms = 5_000;

        let (accepted, client) = tokio::join!(listener.accept(), Client::connect_tcp(port, config));
        let transport = accepted.unwrap();
        let client = client.unwrap();
        let peer = tokio::spawn(async move {
            let (mut reader, writer) = transport.into_split();
            let request = read_frame(&mut reader, MAX_FRAME_SIZE).await.unwrap();
            drop(writer);
            request.map(|packet| packet.packet_type())
        });

        let started = std::time::Instant::now();
        let result = client.handshake().await;
        assert!(
            matches!(result, Err(ClientError::Connection(ConnectionError::Closed))),
            "{:?}",
            result
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(peer.await.unwrap(), Some(PacketType::Handshake));
    }
}
