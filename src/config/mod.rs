//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default websocket endpoint of the chat service
pub const DEFAULT_WS_URL: &str = "wss://ws-api.oneme.ru/websocket";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Chat transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Tunnel engine configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Chat transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Websocket endpoint of the chat service
    pub url: String,
    /// Reply timeout for request/reply exchanges, in seconds
    pub request_timeout_secs: u64,
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            request_timeout_secs: 30,
            max_reconnect_attempts: 5,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Tunnel engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Payload bytes per data chunk
    pub chunk_size: usize,
    /// Accumulator quiescence window, in milliseconds
    pub debounce_ms: u64,
    /// Delay between successive outbound message sends, in milliseconds
    pub send_spacing_ms: u64,
    /// Idle seconds after which the reaper removes a session
    pub idle_timeout_secs: u64,
    /// Port assumed when a tunnel-open host string omits one
    pub default_tcp_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::CHUNK_SIZE,
            debounce_ms: 400,
            send_spacing_ms: 150,
            idle_timeout_secs: 300,
            default_tcp_port: 443,
        }
    }
}

impl TunnelConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn send_spacing(&self) -> Duration {
        Duration::from_millis(self.send_spacing_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Credential record written after the first login
    pub auth_data: String,
    /// Newline-delimited list of authorized sender identifiers
    pub whitelist: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            auth_data: "auth-data.json".to_string(),
            whitelist: "whitelist.txt".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
