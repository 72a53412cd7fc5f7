//! Configuration management

use crate::protocol::{PAGE_SIZE, READ_CHUNK_SIZE, REORDER_WINDOW};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP endpoint configuration
    pub server: ServerConfig,
    /// Engine and session tuning
    pub tunnel: TunnelConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.tunnel.page_size == 0 {
            return Err(crate::Error::Config("tunnel.page_size must be positive".into()));
        }
        if self.tunnel.read_chunk_size == 0 {
            return Err(crate::Error::Config(
                "tunnel.read_chunk_size must be positive".into(),
            ));
        }
        if self.tunnel.reorder_window == 0 {
            return Err(crate::Error::Config(
                "tunnel.reorder_window must be positive".into(),
            ));
        }
        if self.tunnel.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "tunnel.poll_interval_ms must be positive".into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(crate::Error::Config("server.path must start with '/'".into()));
        }
        Ok(())
    }
}

/// HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Base route; sessions live at `{path}/{session}`
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("127.0.0.1:{}", crate::DEFAULT_PORT),
            path: "/tunnel".to_string(),
        }
    }
}

/// Engine and session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Outbound messages per sync response
    pub page_size: usize,
    /// Bytes per socket read
    pub read_chunk_size: usize,
    /// Bounded multiplex wait (milliseconds)
    pub poll_interval_ms: u64,
    /// Sleep when no streams exist (milliseconds)
    pub idle_backoff_ms: u64,
    /// Upper bound on writing one inbound payload (milliseconds)
    pub write_timeout_ms: u64,
    /// Upper bound on one name resolution (milliseconds)
    pub resolve_timeout_ms: u64,
    /// Sequence numbers a session accepts ahead of the next expected one
    pub reorder_window: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            read_chunk_size: READ_CHUNK_SIZE,
            poll_interval_ms: 1000,
            idle_backoff_ms: 1000,
            write_timeout_ms: 30_000,
            resolve_timeout_ms: 5000,
            reorder_window: REORDER_WINDOW,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
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

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
