//! Server discovery
//!
//! Finds loopwire servers on this host by probing a TCP port range or by
//! scanning a directory for Unix sockets. A probe sends DISCOVERY and waits
//! briefly for DISCOVERY_CONFIRM; discovery never needs a handshake.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::network::{Client, NetworkConfig, PacketHandler, Transport, Wait};
use crate::protocol::{Packet, PacketBody, PacketType, DEFAULT_PORT};

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid port range {0}..={1}")]
    InvalidRange(u16, u16),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Where a discovered server can be reached
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp { port: u16 },
    Unix { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { port } => write!(f, "localhost:{}", port),
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A server that answered a discovery probe
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DiscoveredServer {
    pub endpoint: Endpoint,
    /// Platform identifier from DISCOVERY_CONFIRM
    pub platform: String,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub port_start: u16,
    pub port_end: u16,
    /// Directory scanned for Unix sockets
    pub socket_dir: PathBuf,
    /// Substring a socket file name must contain
    pub socket_marker: String,
    /// Per-probe timeout in milliseconds (connect and reply)
    pub timeout_ms: u64,
    /// Probes in flight at once during a port scan
    pub max_concurrent_probes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port_start: DEFAULT_PORT,
            port_end: DEFAULT_PORT + 16,
            socket_dir: PathBuf::from("/tmp"),
            socket_marker: "loopwire".to_string(),
            timeout_ms: 250,
            max_concurrent_probes: 64,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn port_range(&self) -> DiscoveryResult<RangeInclusive<u16>> {
        if self.port_start > self.port_end {
            return Err(DiscoveryError::InvalidRange(self.port_start, self.port_end));
        }
        Ok(self.port_start..=self.port_end)
    }
}

/// Scans this host for servers using a [`DiscoveryConfig`]
pub struct Discovery {
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub async fn scan_tcp(&self) -> DiscoveryResult<Vec<DiscoveredServer>> {
        let ports = self.config.port_range()?;
        Ok(find_tcp_servers(ports, self.config.timeout(), self.config.max_concurrent_probes).await)
    }

    pub async fn scan_unix(&self) -> DiscoveryResult<Vec<DiscoveredServer>> {
        let config = &self.config;
        find_unix_servers(&config.socket_dir, &config.socket_marker, config.timeout()).await
    }

    /// TCP and Unix results together. A missing socket directory only
    /// skips the Unix scan.
    pub async fn scan_all(&self) -> DiscoveryResult<Vec<DiscoveredServer>> {
        let mut found = self.scan_tcp().await?;
        match self.scan_unix().await {
            Ok(unix) => found.extend(unix),
            Err(e) => tracing::debug!("Skipping Unix socket scan: {}", e),
        }
        Ok(found)
    }
}

/// Send DISCOVERY over a fresh transport and return the platform reported
async fn probe(transport: Transport, timeout: Duration) -> Option<String> {
    let client = match Client::from_transport(transport, NetworkConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            tracing::debug!("Probe setup failed: {}", e);
            return None;
        }
    };

    let reply = client
        .exchange_type(Packet::discovery(), PacketType::DiscoveryConfirm, Wait::Within(timeout))
        .await;
    client.close().await;

    match reply {
        Ok(Some(packet)) => match packet.into_body() {
            PacketBody::DiscoveryConfirm { platform } => Some(platform),
            _ => None,
        },
        Ok(None) => None,
        Err(e) => {
            tracing::debug!("Probe failed: {}", e);
            None
        }
    }
}

/// Probe a single loopback port
pub async fn probe_tcp(port: u16, timeout: Duration) -> Option<DiscoveredServer> {
    let transport = tokio::time::timeout(timeout, Transport::connect_tcp(port))
        .await
        .ok()?
        .ok()?;
    let platform = probe(transport, timeout).await?;
    tracing::debug!("Found server on port {} ({})", port, platform);
    Some(DiscoveredServer {
        endpoint: Endpoint::Tcp { port },
        platform,
    })
}

/// Probe a single Unix socket
pub async fn probe_unix(path: &Path, timeout: Duration) -> Option<DiscoveredServer> {
    let transport = tokio::time::timeout(timeout, Transport::connect_unix(path))
        .await
        .ok()?
        .ok()?;
    let platform = probe(transport, timeout).await?;
    tracing::debug!("Found server at {} ({})", path.display(), platform);
    Some(DiscoveredServer {
        endpoint: Endpoint::Unix {
            path: path.to_path_buf(),
        },
        platform,
    })
}

/// Probe every port in `ports`, at most `concurrency` at a time.
/// Results are sorted by port.
pub async fn find_tcp_servers(
    ports: RangeInclusive<u16>,
    timeout: Duration,
    concurrency: usize,
) -> Vec<DiscoveredServer> {
    let concurrency = concurrency.max(1);
    let mut probes = JoinSet::new();
    let mut found = Vec::new();

    for port in ports {
        if probes.len() >= concurrency {
            collect_next(&mut probes, &mut found).await;
        }
        probes.spawn(probe_tcp(port, timeout));
    }
    while !probes.is_empty() {
        collect_next(&mut probes, &mut found).await;
    }

    found.sort();
    found
}

async fn collect_next(
    probes: &mut JoinSet<Option<DiscoveredServer>>,
    found: &mut Vec<DiscoveredServer>,
) {
    match probes.join_next().await {
        Some(Ok(Some(server))) => found.push(server),
        Some(Err(e)) => tracing::warn!("Discovery probe panicked: {}", e),
        _ => {}
    }
}

/// Whether a directory entry name looks like one of our sockets
fn is_candidate(name: &str, marker: &str) -> bool {
    name.contains(marker) && name.ends_with(".sock")
}

/// Probe every socket in `dir` whose name contains `marker` and ends in
/// `.sock`. Results are sorted by path.
pub async fn find_unix_servers(
    dir: &Path,
    marker: &str,
    timeout: Duration,
) -> DiscoveryResult<Vec<DiscoveredServer>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut probes = JoinSet::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_candidate(&name.to_string_lossy(), marker) {
            continue;
        }
        let path = entry.path();
        probes.spawn(async move { probe_unix(&path, timeout).await });
    }

    let mut found = Vec::new();
    while !probes.is_empty() {
        collect_next(&mut probes, &mut found).await;
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_names() {
        assert!(is_candidate("loopwire@1234.sock", "loopwire"));
        assert!(!is_candidate("loopwire@1234.pid", "loopwire"));
        assert!(!is_candidate("other@1234.sock", "loopwire"));
    }

    #[test]
    fn test_invalid_range() {
        let config = DiscoveryConfig {
            port_start: 10,
            port_end: 5,
            ..Default::default()
        };
        assert!(matches!(config.port_range(), Err(DiscoveryError::InvalidRange(10, 5))));
    }

    #[test]
    fn test_endpoint_json() {
        let server = DiscoveredServer {
            endpoint: Endpoint::Tcp { port: 4862 },
            platform: "X".to_string(),
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(json["endpoint"]["transport"], "tcp");
        assert_eq!(json["endpoint"]["port"], 4862);
        assert_eq!(json["platform"], "X");
    }

    #[tokio::test]
    async fn test_missing_socket_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = find_unix_servers(&missing, "loopwire", Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DiscoveryError::Io(_))));
    }
}
