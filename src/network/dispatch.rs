//! Packet dispatch
//!
//! A [`ListenerRegistry`] delivers every received packet to its listeners
//! in registration order. Blocking waits (`wait_for`, `exchange`,
//! `poll_ping`) are built on temporary listeners that remove themselves on
//! their first match.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::{ConnectionError, ConnectionHandle};
use crate::protocol::{Packet, PacketType};

/// Persistent listener callback. The handle names the connection the packet
/// arrived on.
pub type Listener = dyn Fn(&Packet, &ConnectionHandle) + Send + Sync;

type Matcher = dyn Fn(&Packet, &ConnectionHandle) -> bool + Send + Sync;

/// How long a blocking wait may take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Within(Duration),
    /// No timeout. Still resolves (with nothing) if the registry releases
    /// its pending waits on close.
    Forever,
}

impl From<Duration> for Wait {
    fn from(duration: Duration) -> Self {
        Wait::Within(duration)
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Callback {
    Persistent(Box<Listener>),
    Temporary {
        matcher: Box<Matcher>,
        spent: Mutex<bool>,
    },
}

struct Entry {
    id: ListenerId,
    callback: Callback,
}

impl Entry {
    fn retire(&self) {
        if let Callback::Temporary { spent, .. } = &self.callback {
            *spent.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }
    }
}

/// Concurrently mutable, ordered set of listeners.
///
/// Copy-on-write: dispatch iterates a snapshot, so listeners may register or
/// unregister (themselves included) while a packet is being delivered.
pub struct ListenerRegistry {
    entries: RwLock<Arc<Vec<Arc<Entry>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Entry>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Arc<Entry>>)) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Arc<Entry>> = (**entries).clone();
        f(&mut next);
        *entries = Arc::new(next);
    }

    fn insert(&self, callback: Callback) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.update(|entries| entries.push(Arc::new(Entry { id, callback })));
        id
    }

    /// Register a listener for every packet
    pub fn handle<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) + Send + Sync + 'static,
    {
        self.insert(Callback::Persistent(Box::new(listener)))
    }

    /// Register a listener for packets of one type
    pub fn handle_type<F>(&self, packet_type: PacketType, listener: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) + Send + Sync + 'static,
    {
        self.handle(move |packet, origin| {
            if packet.packet_type() == packet_type {
                listener(packet, origin);
            }
        })
    }

    /// Register a listener that is removed the first time it returns `true`.
    /// It matches at most once, even under concurrent dispatch.
    pub fn temporarily_handle<F>(&self, matcher: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) -> bool + Send + Sync + 'static,
    {
        self.insert(Callback::Temporary {
            matcher: Box::new(matcher),
            spent: Mutex::new(false),
        })
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.update(|entries| {
            entries.retain(|entry| {
                if entry.id == id {
                    entry.retire();
                    removed = true;
                    false
                } else {
                    true
                }
            })
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Drop every temporary listener. Pending waits resolve with nothing.
    pub fn release_pending(&self) {
        self.update(|entries| {
            entries.retain(|entry| match entry.callback {
                Callback::Persistent(_) => true,
                Callback::Temporary { .. } => {
                    entry.retire();
                    false
                }
            })
        });
    }

    /// Deliver a packet to every listener, in registration order
    pub fn dispatch(&self, packet: &Packet, origin: &ConnectionHandle) {
        for entry in self.snapshot().iter() {
            match &entry.callback {
                Callback::Persistent(listener) => listener(packet, origin),
                Callback::Temporary { matcher, spent } => {
                    let matched = {
                        let mut spent = spent.lock().unwrap_or_else(PoisonError::into_inner);
                        if *spent || !matcher(packet, origin) {
                            false
                        } else {
                            *spent = true;
                            true
                        }
                    };
                    if matched {
                        self.unregister(entry.id);
                    }
                }
            }
        }
    }

    /// Arm a one-shot match for the first packet satisfying `predicate`.
    /// The listener is registered before this returns, so a reply to a
    /// packet sent afterwards cannot be missed.
    pub fn arm<P>(self: &Arc<Self>, predicate: P) -> PendingMatch
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.temporarily_handle(move |packet, _| {
            if !predicate(packet) {
                return false;
            }
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(packet.clone());
            }
            true
        });

        PendingMatch {
            _guard: ListenerGuard {
                registry: Arc::clone(self),
                id,
            },
            rx,
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters its listener when dropped
pub struct ListenerGuard {
    registry: Arc<ListenerRegistry>,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// An armed wait. Dropping it without waiting unregisters the listener.
pub struct PendingMatch {
    _guard: ListenerGuard,
    rx: oneshot::Receiver<Packet>,
}

impl PendingMatch {
    /// Wait for the match. `None` on timeout or when the registry released
    /// its pending waits.
    pub async fn wait(self, wait: Wait) -> Option<Packet> {
        let PendingMatch { _guard, rx } = self;
        match wait {
            Wait::Within(duration) => tokio::time::timeout(duration, rx).await.ok()?.ok(),
            Wait::Forever => rx.await.ok(),
        }
    }
}

/// Send/receive surface shared by clients and servers
#[async_trait]
pub trait PacketHandler: Send + Sync {
    fn registry(&self) -> &Arc<ListenerRegistry>;

    /// Send a packet. A server broadcasts to every live connection.
    async fn send(&self, packet: Packet) -> Result<(), ConnectionError>;

    /// Close the local side. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    fn handle<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) + Send + Sync + 'static,
    {
        self.registry().handle(listener)
    }

    fn handle_type<F>(&self, packet_type: PacketType, listener: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) + Send + Sync + 'static,
    {
        self.registry().handle_type(packet_type, listener)
    }

    fn temporarily_handle<F>(&self, matcher: F) -> ListenerId
    where
        F: Fn(&Packet, &ConnectionHandle) -> bool + Send + Sync + 'static,
    {
        self.registry().temporarily_handle(matcher)
    }

    fn unregister(&self, id: ListenerId) -> bool {
        self.registry().unregister(id)
    }

    /// Wait for the first packet matching `predicate`
    async fn wait_for<P>(&self, predicate: P, wait: Wait) -> Option<Packet>
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        self.registry().arm(predicate).wait(wait).await
    }

    async fn wait_for_next(&self, packet_type: PacketType, wait: Wait) -> Option<Packet> {
        self.wait_for(move |packet| packet.packet_type() == packet_type, wait)
            .await
    }

    /// Send `packet` and wait for the first reply matching `predicate`.
    /// The match is armed before the send.
    async fn exchange<P>(
        &self,
        packet: Packet,
        predicate: P,
        wait: Wait,
    ) -> Result<Option<Packet>, ConnectionError>
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        let pending = self.registry().arm(predicate);
        self.send(packet).await?;
        Ok(pending.wait(wait).await)
    }

    async fn exchange_type(
        &self,
        packet: Packet,
        reply_type: PacketType,
        wait: Wait,
    ) -> Result<Option<Packet>, ConnectionError> {
        self.exchange(packet, move |reply| reply.packet_type() == reply_type, wait)
            .await
    }

    /// Round trip time of a ping, measured from just before the ping is
    /// built until its pong arrives. A wait cut short by close yields
    /// `Closed`, not `Timeout`.
    async fn poll_ping(&self, wait: Wait) -> Result<Duration, ConnectionError> {
        let start = Instant::now();
        let ping = Packet::ping();
        let id = ping.correlation_id();

        let is_pong = move |reply: &Packet| {
            reply.packet_type() == PacketType::Pong && reply.correlation_id() == id
        };
        match self.exchange(ping, is_pong, wait).await? {
            Some(_) => Ok(start.elapsed()),
            None if self.is_closed() => Err(ConnectionError::Closed),
            None => Err(ConnectionError::Timeout),
        }
    }

    /// Tell the peer we are going away, then close
    async fn cleanly_close(&self, exit_code: i32) -> Result<(), ConnectionError> {
        let result = self.send(Packet::connection_killed(exit_code)).await;
        self.close().await;
        result
    }
}
