//! Connection handling for loopwire
//!
//! Every connection runs three tasks:
//! - reader: reads frames off the transport and queues them for dispatch
//! - dispatcher: hands each packet to the listener registry, in receipt order
//! - writer: sole owner of the write half and encode buffer, one flushed
//!   frame per queued packet
//!
//! The connection closes once the dispatcher runs dry, so replies queued for
//! the last packets a peer sent are still written before shutdown.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};

use super::{BoxedReader, BoxedWriter, ListenerRegistry, PeerAddr, Transport};
use crate::protocol::{read_frame, FrameWriter, FramingError, Packet};

/// Capacity of the inbound and outbound packet queues
pub const CHANNEL_CAPACITY: usize = 256;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out waiting for a reply")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A packet queued for the writer task
pub(crate) struct Outbound {
    pub(crate) packet: Packet,
    ack: Option<oneshot::Sender<ConnectionResult<()>>>,
}

struct HandleInner {
    id: ConnectionId,
    peer: PeerAddr,
    outbound: mpsc::Sender<Outbound>,
    closed: watch::Sender<bool>,
}

/// A cheap, cloneable handle for sending on and closing a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(peer: PeerAddr) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::next(),
                peer,
                outbound,
                closed,
            }),
        };
        (handle, rx)
    }

    /// A handle with no tasks behind it; queued packets land in the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<Outbound>) {
        Self::new(PeerAddr::Tcp(std::net::SocketAddr::from(([127, 0, 0, 1], 0))))
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Send a packet and wait until it has been written and flushed.
    /// Waits for room when the outbound queue is full.
    pub async fn send(&self, packet: Packet) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (ack, done) = oneshot::channel();
        self.inner
            .outbound
            .send(Outbound {
                packet,
                ack: Some(ack),
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        done.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Queue a packet without waiting for the write. Used from listeners,
    /// which run synchronously on the dispatcher task. Returns `false` if the
    /// connection is closed or its outbound queue is full.
    pub fn queue(&self, packet: Packet) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.inner.outbound.try_send(Outbound { packet, ack: None }) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    "Outbound queue of {} full, dropping {}",
                    self.inner.id,
                    dropped.packet
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Mark the connection closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let changed = self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if changed {
            tracing::info!("Connection {} to {} closed", self.inner.id, self.inner.peer);
        }
        changed
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        wait_closed(&mut self.inner.closed.subscribe()).await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live connection and its tasks. Dropping it closes the connection.
pub struct Connection {
    handle: ConnectionHandle,
}

impl Connection {
    /// Start the reader, dispatcher and writer tasks for a transport.
    /// Packets are dispatched to `registry`.
    pub fn spawn(
        transport: Transport,
        registry: Arc<ListenerRegistry>,
        max_frame_size: usize,
    ) -> io::Result<Self> {
        let peer = transport.peer_addr()?;
        let (reader, writer) = transport.into_split();
        let (handle, outbound) = ConnectionHandle::new(peer);
        let (packets_tx, packets_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tracing::info!("Connection {} established with {}", handle.id(), handle.peer_addr());

        tokio::spawn(read_loop(reader, handle.clone(), packets_tx, max_frame_size));
        tokio::spawn(dispatch_loop(packets_rx, handle.clone(), registry));
        tokio::spawn(write_loop(writer, handle.clone(), outbound, max_frame_size));

        Ok(Self { handle })
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.close();
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Ends at end of stream, on a fatal read error or on close. Dropping the
/// packet sender then lets the dispatcher finish.
async fn read_loop(
    mut reader: BoxedReader,
    handle: ConnectionHandle,
    packets: mpsc::Sender<Packet>,
    max_frame_size: usize,
) {
    let mut closed = handle.inner.closed.subscribe();

    loop {
        let result = tokio::select! {
            result = read_frame(&mut reader, max_frame_size) => result,
            _ = wait_closed(&mut closed) => break,
        };

        match result {
            Ok(Some(packet)) => {
                tracing::trace!("Received {} on {}", packet, handle.id());
                if packets.send(packet).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("Connection {} reached end of stream", handle.id());
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Dropping malformed frame on {}: {}", handle.id(), e);
            }
            Err(e) => {
                if handle.is_closed() {
                    tracing::debug!("Read error on closed connection {}: {}", handle.id(), e);
                } else {
                    tracing::warn!("Read error on connection {}: {}", handle.id(), e);
                }
                break;
            }
        }
    }
}

async fn dispatch_loop(
    mut packets: mpsc::Receiver<Packet>,
    handle: ConnectionHandle,
    registry: Arc<ListenerRegistry>,
) {
    while let Some(packet) = packets.recv().await {
        registry.dispatch(&packet, &handle);
    }
    handle.close();
}

async fn write_loop(
    writer: BoxedWriter,
    handle: ConnectionHandle,
    mut outbound: mpsc::Receiver<Outbound>,
    max_frame_size: usize,
) {
    let mut writer = FrameWriter::new(writer, max_frame_size);
    let mut closed = handle.inner.closed.subscribe();
    let mut healthy = true;

    while healthy {
        let next = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = outbound.recv() => next,
        };
        match next {
            Some(item) => healthy = write_outbound(&mut writer, &handle, item).await,
            None => break,
        }
    }

    // Packets queued before the close still go out
    outbound.close();
    while healthy {
        let Ok(item) = outbound.try_recv() else {
            break;
        };
        healthy = write_outbound(&mut writer, &handle, item).await;
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Shutdown of connection {} failed: {}", handle.id(), e);
    }
}

/// Write one queued packet and acknowledge it. Returns `false` once the
/// stream is unusable.
async fn write_outbound(
    writer: &mut FrameWriter<BoxedWriter>,
    handle: &ConnectionHandle,
    Outbound { packet, ack }: Outbound,
) -> bool {
    let result = writer.write_packet(&packet).await;
    let healthy = result.is_ok();
    if let Err(e) = &result {
        if handle.is_closed() {
            tracing::debug!("Write error on closed connection {}: {}", handle.id(), e);
        } else {
            tracing::warn!("Write error on connection {}: {}", handle.id(), e);
        }
    }
    if let Some(ack) = ack {
        let _ = ack.send(result.map_err(ConnectionError::from));
    }
    if !healthy {
        handle.close();
    }
    healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{BaseListener, Side, TransportListener};
    use crate::protocol::{PacketType, Value, WireBuffer, MAX_FRAME_SIZE, PROTOCOL_VERSION};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const WAIT: Duration = Duration::from_secs(2);

    async fn pair(registry: Arc<ListenerRegistry>) -> (Connection, Connection) {
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), Transport::connect_tcp(port));

        let server = Connection::spawn(accepted.unwrap(), registry.clone(), MAX_FRAME_SIZE);
        let client = Connection::spawn(connected.unwrap(), registry, MAX_FRAME_SIZE);
        (server.unwrap(), client.unwrap())
    }

    /// A connection whose peer is a bare socket the test writes to directly
    async fn raw_peer(registry: Arc<ListenerRegistry>) -> (Connection, TcpStream) {
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        let connect = TcpStream::connect(("127.0.0.1", port));
        let (accepted, raw) = tokio::join!(listener.accept(), connect);

        let connection = Connection::spawn(accepted.unwrap(), registry, MAX_FRAME_SIZE).unwrap();
        (connection, raw.unwrap())
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut buf = WireBuffer::new();
        packet.encode_into(&mut buf).unwrap();
        buf.flush().unwrap().to_vec()
    }

    fn collector(registry: &ListenerRegistry) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.handle(move |packet: &Packet, _: &ConnectionHandle| {
            let _ = tx.send(packet.clone());
        });
        rx
    }

    #[tokio::test]
    async fn test_send_and_dispatch_in_order() {
        let registry = Arc::new(ListenerRegistry::new());
        let mut rx = collector(&registry);

        let (_server, client) = pair(registry).await;
        for code in 0..5 {
            client.handle().send(Packet::connection_killed(code)).await.unwrap();
        }
        // No base listener here, so CONNECTION_KILLED is an ordinary packet
        for code in 0..5 {
            let packet = rx.recv().await.unwrap();
            assert_eq!(packet, Packet::connection_killed(code));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = Arc::new(ListenerRegistry::new());
        let (server, client) = pair(registry).await;

        assert!(client.handle().close());
        assert!(!client.handle().close());
        assert!(client.handle().is_closed());
        assert!(matches!(
            client.handle().send(Packet::handshake()).await,
            Err(ConnectionError::Closed)
        ));
        assert!(!client.handle().queue(Packet::handshake()));

        // The peer sees end of stream and closes too
        tokio::time::timeout(WAIT, server.handle().closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let registry = Arc::new(ListenerRegistry::new());
        let (server, client) = pair(registry).await;
        let handle = client.handle().clone();
        drop(client);
        assert!(handle.is_closed());
        tokio::time::timeout(WAIT, server.handle().closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_from_listener_reaches_peer() {
        let registry = Arc::new(ListenerRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.handle(move |packet: &Packet, origin: &ConnectionHandle| {
            match packet.packet_type() {
                PacketType::Ping => {
                    origin.queue(Packet::pong(packet.correlation_id().unwrap_or_default()));
                }
                PacketType::Pong => {
                    let _ = tx.send(packet.correlation_id());
                }
                _ => {}
            }
        });

        let (_server, client) = pair(registry).await;
        client.handle().send(Packet::pong(0)).await.unwrap();
        client.handle().send(Packet::ping()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(0));
        assert!(rx.recv().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_framing_errors_close_connection() {
        let negative: &[u8] = &[1, 0, 0xFF, 0xFF, 0xFF, 0xFD];
        let oversize: &[u8] = &[1, 0, 0x7F, 0, 0, 0];
        let short: &[u8] = &[1, 5, 0];

        for frame in [negative, oversize, short] {
            let registry = Arc::new(ListenerRegistry::new());
            let mut rx = collector(&registry);
            let (connection, mut raw) = raw_peer(registry).await;

            raw.write_all(frame).await.unwrap();
            raw.shutdown().await.unwrap();

            tokio::time::timeout(WAIT, connection.handle().closed())
                .await
                .unwrap_or_else(|_| panic!("{:?} did not close the connection", frame));
            assert!(rx.recv().await.is_none(), "{:?} was dispatched", frame);
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let registry = Arc::new(ListenerRegistry::new());
        let mut rx = collector(&registry);
        let (connection, mut raw) = raw_peer(registry).await;

        // DISCOVERY_CONFIRM whose platform field is an int
        let mut buf = WireBuffer::new();
        buf.put_version(PROTOCOL_VERSION).unwrap();
        buf.put_opcode(PacketType::DiscoveryConfirm.opcode()).unwrap();
        buf.put_int(7);
        raw.write_all(&buf.flush().unwrap()).await.unwrap();

        let next = Packet::application(40, vec![Value::Bool(true)]);
        raw.write_all(&encode(&next)).await.unwrap();

        let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(received, Some(next));
        assert!(!connection.handle().is_closed());
    }

    #[tokio::test]
    async fn test_replies_survive_peer_half_close() {
        let registry = Arc::new(ListenerRegistry::new());
        BaseListener::new(Side::Server {
            platform: "X".to_string(),
            version: PROTOCOL_VERSION,
        })
        .install(&registry);
        let (connection, mut raw) = raw_peer(registry).await;

        let ping = Packet::ping();
        raw.write_all(&encode(&Packet::discovery())).await.unwrap();
        raw.write_all(&encode(&ping)).await.unwrap();
        raw.shutdown().await.unwrap();

        let first = tokio::time::timeout(WAIT, read_frame(&mut raw, MAX_FRAME_SIZE)).await;
        assert_eq!(first.unwrap().unwrap(), Some(Packet::discovery_confirm("X")));
        let second = tokio::time::timeout(WAIT, read_frame(&mut raw, MAX_FRAME_SIZE)).await;
        let pong = second.unwrap().unwrap().unwrap();
        assert_eq!(pong.correlation_id(), ping.correlation_id());

        // Then the server side finishes and shuts down
        tokio::time::timeout(WAIT, connection.handle().closed()).await.unwrap();
        let end = tokio::time::timeout(WAIT, read_frame(&mut raw, MAX_FRAME_SIZE)).await;
        assert!(end.unwrap().unwrap().is_none());
    }

    #[test]
    fn test_queue_is_bounded() {
        let (handle, mut rx) = ConnectionHandle::detached();
        for _ in 0..CHANNEL_CAPACITY {
            assert!(handle.queue(Packet::handshake()));
        }
        assert!(!handle.queue(Packet::handshake()));

        rx.try_recv().unwrap();
        assert!(handle.queue(Packet::handshake()));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _) = ConnectionHandle::detached();
        let (b, _) = ConnectionHandle::detached();
        assert_ne!(a.id(), b.id());
    }
}
