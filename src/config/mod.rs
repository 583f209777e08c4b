//! Configuration module
//!
//! Handles loading and saving loopwire configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::network::NetworkConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name, used to name Unix sockets
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_app_name() -> String {
    "loopwire".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        for path in Self::default_paths() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(&path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Locations searched by `load_default`, in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("loopwire/config.toml")),
            Some(PathBuf::from("./loopwire.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Socket path used when the network transport is `unix`
    pub fn socket_path(&self) -> PathBuf {
        self.network.resolve_socket_path(&self.general.app_name)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let mut config = Config::default();
    config.network.platform = "my-daemon".to_string();
    config.network.socket_path = Some(PathBuf::from("/tmp/loopwire@daemon.sock"));
    config.discovery.port_end = config.discovery.port_start + 8;

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TransportKind;
    use crate::protocol::{DEFAULT_PORT, PROTOCOL_VERSION};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.general.app_name, "loopwire");
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.port = 5000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 5000);
        assert_eq!(loaded.discovery.socket_dir, config.discovery.socket_dir);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\ntransport = \"unix\"\nhandshake_timeout_ms = 10").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.transport, TransportKind::Unix);
        assert_eq!(loaded.network.handshake_timeout_ms, 10);
        assert_eq!(loaded.network.port, DEFAULT_PORT);
        assert_eq!(loaded.discovery.socket_marker, "loopwire");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.network.platform, "my-daemon");
        assert_eq!(parsed.socket_path(), PathBuf::from("/tmp/loopwire@daemon.sock"));
    }
}
