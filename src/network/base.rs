//! Built-in protocol listener
//!
//! Installed first on every registry. Answers PING, honours
//! CONNECTION_KILLED and, on the server side, answers DISCOVERY and
//! HANDSHAKE. Replies always go back to the connection the packet came from.

use super::{ConnectionHandle, ListenerId, ListenerRegistry};
use crate::protocol::{Packet, PacketBody};

/// Which end of the connection the listener serves
#[derive(Debug, Clone)]
pub enum Side {
    Client,
    Server {
        /// Reported in DISCOVERY_CONFIRM
        platform: String,
        /// Version a HANDSHAKE must carry to be accepted
        version: u8,
    },
}

pub struct BaseListener {
    side: Side,
}

impl BaseListener {
    pub fn new(side: Side) -> Self {
        Self { side }
    }

    /// Register on `registry`, which should not have any listeners yet
    pub fn install(self, registry: &ListenerRegistry) -> ListenerId {
        if !registry.is_empty() {
            tracing::warn!("Base listener installed behind {} other listeners", registry.len());
        }
        registry.handle(move |packet, origin| self.on_packet(packet, origin))
    }

    fn on_packet(&self, packet: &Packet, origin: &ConnectionHandle) {
        match packet.body() {
            PacketBody::Ping { id } => {
                origin.queue(Packet::pong(*id));
            }
            PacketBody::ConnectionKilled { exit_code } => {
                tracing::info!(
                    "Peer {} killed the connection (exit code {})",
                    origin.peer_addr(),
                    exit_code
                );
                origin.close();
            }
            _ => {
                if let Side::Server { platform, version } = &self.side {
                    on_server_packet(packet, origin, platform, *version);
                }
            }
        }
    }
}

fn on_server_packet(packet: &Packet, origin: &ConnectionHandle, platform: &str, version: u8) {
    match packet.body() {
        PacketBody::Discovery => {
            tracing::debug!("Discovery probe from {}", origin.peer_addr());
            origin.queue(Packet::discovery_confirm(platform));
        }
        PacketBody::Handshake => {
            let reply = if packet.version() == version {
                tracing::debug!("Accepted handshake from {}", origin.peer_addr());
                Packet::handshake_confirm()
            } else {
                tracing::debug!(
                    "Refused handshake from {}: version {} (expected {})",
                    origin.peer_addr(),
                    packet.version(),
                    version
                );
                Packet::handshake_refuse(format!(
                    "Incompatible client version (expected {}, got {})",
                    version,
                    packet.version()
                ))
            };
            origin.queue(reply);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    fn server_registry() -> ListenerRegistry {
        let registry = ListenerRegistry::new();
        BaseListener::new(Side::Server {
            platform: "X".to_string(),
            version: 3,
        })
        .install(&registry);
        registry
    }

    #[test]
    fn test_ping_gets_pong_with_same_id() {
        let registry = ListenerRegistry::new();
        BaseListener::new(Side::Client).install(&registry);

        let (origin, mut rx) = ConnectionHandle::detached();
        let ping = Packet::ping();
        registry.dispatch(&Packet::pong(1), &origin);
        registry.dispatch(&ping, &origin);

        let reply = rx.try_recv().unwrap().packet;
        assert_eq!(reply.packet_type(), PacketType::Pong);
        assert_eq!(reply.correlation_id(), ping.correlation_id());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connection_killed_closes() {
        let registry = ListenerRegistry::new();
        BaseListener::new(Side::Client).install(&registry);

        let (origin, _rx) = ConnectionHandle::detached();
        registry.dispatch(&Packet::connection_killed(0), &origin);
        assert!(origin.is_closed());
    }

    #[test]
    fn test_client_ignores_discovery() {
        let registry = ListenerRegistry::new();
        BaseListener::new(Side::Client).install(&registry);

        let (origin, mut rx) = ConnectionHandle::detached();
        registry.dispatch(&Packet::discovery(), &origin);
        registry.dispatch(&Packet::handshake(), &origin);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_answers_discovery() {
        let registry = server_registry();
        let (origin, mut rx) = ConnectionHandle::detached();
        registry.dispatch(&Packet::discovery(), &origin);
        assert_eq!(rx.try_recv().unwrap().packet, Packet::discovery_confirm("X"));
    }

    #[test]
    fn test_server_handshake() {
        let registry = server_registry();
        let (origin, mut rx) = ConnectionHandle::detached();

        registry.dispatch(&Packet::with_version(3, PacketBody::Handshake), &origin);
        assert_eq!(rx.try_recv().unwrap().packet, Packet::handshake_confirm());

        registry.dispatch(&Packet::with_version(1, PacketBody::Handshake), &origin);
        match rx.try_recv().unwrap().packet.into_body() {
            PacketBody::HandshakeRefuse { reason } => {
                assert_eq!(reason, "Incompatible client version (expected 3, got 1)");
            }
            other => panic!("expected refusal, got {:?}", other),
        }
    }
}
