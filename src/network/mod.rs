//! Network module - Handles same-host connections between loopwire peers
//!
//! Provides:
//! - Transports over TCP loopback and Unix domain sockets
//! - Per-connection read, dispatch and write tasks
//! - Listener registry with blocking waits and request/response exchanges
//! - Client and server connection managers

mod base;
mod client;
mod connection;
mod dispatch;
mod server;
mod transport;

pub use base::*;
pub use client::*;
pub use connection::*;
pub use dispatch::*;
pub use server::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{DEFAULT_PLATFORM, DEFAULT_PORT, MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Transport used by `serve` and `ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Unix,
}

/// Configuration for network operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    pub transport: TransportKind,
    /// Unix socket path; defaults to `/tmp/<app>@<pid>.sock`
    pub socket_path: Option<PathBuf>,
    /// Platform identifier reported to discovery probes
    pub platform: String,
    /// Version sent in (client) or required of (server) a handshake
    pub protocol_version: u8,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Maximum frame payload size
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            transport: TransportKind::Tcp,
            socket_path: None,
            platform: DEFAULT_PLATFORM.to_string(),
            protocol_version: PROTOCOL_VERSION,
            connect_timeout_ms: 5000,
            handshake_timeout_ms: 3000,
            ping_timeout_ms: 3000,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.transport = TransportKind::Unix;
        self.socket_path = Some(path.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Socket path to bind or connect to for the given application name
    pub fn resolve_socket_path(&self, app_name: &str) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| unix_socket_path(app_name))
    }
}
