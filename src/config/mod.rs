//! Configuration module
//!
//! Handles loading and saving Rollcall configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::NetworkConfig;
use crate::protocol::{DEFAULT_ADMISSION_PORT, DEFAULT_HOST, DEFAULT_SESSION_PORT};

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

    /// Network settings shared by server and client
    #[serde(default)]
    pub network: NetworkSection,

    /// Server-only settings
    #[serde(default)]
    pub server: ServerSection,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Display name of the local participant (random if not set)
    pub name: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Host of the server sockets
    #[serde(default = "default_host")]
    pub host: String,
    /// Session socket port
    #[serde(default = "default_session_port")]
    pub session_port: u16,
    /// Admission socket port
    #[serde(default = "default_admission_port")]
    pub admission_port: u16,
    /// Presentation refresh rate (network ticks at twice this)
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Handshake reply timeout in ms
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Outbound queue capacity
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Idle frames before a client pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_frames: u32,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_session_port() -> u16 {
    DEFAULT_SESSION_PORT
}

fn default_admission_port() -> u16 {
    DEFAULT_ADMISSION_PORT
}

fn default_frame_rate() -> u32 {
    60
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_ping_interval() -> u32 {
    180
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            session_port: default_session_port(),
            admission_port: default_admission_port(),
            frame_rate: default_frame_rate(),
            handshake_timeout_ms: default_handshake_timeout(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            ping_interval_frames: default_ping_interval(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Maximum concurrent participants
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Close the admission socket once full
    #[serde(default = "default_true")]
    pub close_when_full: bool,
    /// Idle timeout in ms (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

fn default_max_clients() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    10_000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            close_when_full: default_true(),
            idle_timeout_ms: default_idle_timeout(),
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
        let config_paths = [
            dirs::config_dir().map(|p| p.join("rollcall/config.toml")),
            Some(PathBuf::from("./rollcall.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
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

    /// Runtime network settings
    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.network.host.clone(),
            session_port: self.network.session_port,
            admission_port: self.network.admission_port,
            frame_rate: self.network.frame_rate,
            handshake_timeout_ms: self.network.handshake_timeout_ms,
            max_clients: self.server.max_clients,
            close_when_full: self.server.close_when_full,
            idle_timeout_ms: Some(self.server.idle_timeout_ms).filter(|&ms| ms > 0),
            outbound_queue_capacity: self.network.outbound_queue_capacity,
            ping_interval_frames: self.network.ping_interval_frames,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: Some("slime".to_string()),
            verbose: false,
        },
        server: ServerSection {
            max_clients: 4,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.session_port, DEFAULT_SESSION_PORT);
        assert_eq!(config.network.admission_port, DEFAULT_ADMISSION_PORT);
        assert_eq!(config.server.max_clients, 3);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.server.max_clients = 8;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.server.max_clients, 8);
        assert_eq!(loaded.network.host, config.network.host);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/rollcall.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[server]\nidle_timeout_ms = 0\n").unwrap();

        let network = config.network_config();
        assert_eq!(network.idle_timeout_ms, None);
        assert_eq!(network.max_clients, 3);
        assert_eq!(network.session_port, DEFAULT_SESSION_PORT);
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name.as_deref(), Some("slime"));
        assert_eq!(parsed.network_config().max_clients, 4);
    }
}
