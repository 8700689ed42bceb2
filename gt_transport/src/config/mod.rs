//! Configuration for the transport engines.
//!
//! A [`TransportConfig`] is read from TOML, validated, and may be overridden
//! through `GT_TRANSPORT_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::EngineKind;
use crate::tls::ALPN;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Settings of the native callback engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NativeConfig {
    /// Engine worker threads delivering callbacks (default: 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Unacknowledged bytes a stream may hold (default: 256 KiB)
    #[serde(default = "default_stream_receive_window")]
    pub stream_receive_window: u64,

    /// Largest chunk per receive event (default: 64 KiB)
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_worker_threads() -> usize {
    2
}

fn default_stream_receive_window() -> u64 {
    256 * 1024
}

fn default_max_chunk_size() -> usize {
    64 * 1024
}

impl Default for NativeConfig {
    fn default() -> Self {
        NativeConfig {
            worker_threads: default_worker_threads(),
            stream_receive_window: default_stream_receive_window(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Settings of the software engines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoftwareConfig {
    /// Runtime worker threads (default: 2)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        SoftwareConfig {
            worker_threads: default_worker_threads(),
        }
    }
}

/// Main transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Engine carrying the transport (default: native)
    #[serde(default)]
    pub engine: EngineKind,

    /// ALPN tag negotiated on every connection (default: "gt-quic")
    #[serde(default = "default_alpn")]
    pub alpn: String,

    /// Idle timeout in milliseconds (default: 30000)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Handshake timeout in milliseconds (default: 10000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Keep-alive interval in milliseconds, 0 disables (default: 10000)
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Inbound connections queued before accept (default: 64)
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: usize,

    /// Peer streams queued per connection (default: 16)
    #[serde(default = "default_stream_backlog")]
    pub stream_backlog: usize,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub native: NativeConfig,

    #[serde(default)]
    pub software: SoftwareConfig,
}

fn default_alpn() -> String {
    ALPN.to_string()
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_ms() -> u64 {
    10_000
}

fn default_connection_backlog() -> usize {
    64
}

fn default_stream_backlog() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            engine: EngineKind::default(),
            alpn: default_alpn(),
            idle_timeout_ms: default_idle_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            connection_backlog: default_connection_backlog(),
            stream_backlog: default_stream_backlog(),
            log_level: default_log_level(),
            native: NativeConfig::default(),
            software: SoftwareConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Default configuration using `engine`.
    pub fn with_engine(engine: EngineKind) -> Self {
        TransportConfig {
            engine,
            ..TransportConfig::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;

        // Environment variables take precedence over the file
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(key: &str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            Ok(())
        }

        if self.alpn.is_empty() {
            return Err(ConfigError::MissingValue("alpn".to_string()));
        }
        if self.alpn.len() > 255 {
            return Err(ConfigError::InvalidValue {
                key: "alpn".to_string(),
                message: "must be at most 255 bytes".to_string(),
            });
        }
        positive("idle_timeout_ms", self.idle_timeout_ms)?;
        positive("handshake_timeout_ms", self.handshake_timeout_ms)?;
        positive("connection_backlog", self.connection_backlog as u64)?;
        positive("stream_backlog", self.stream_backlog as u64)?;
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::MissingValue("log_level".to_string()));
        }

        positive("native.worker_threads", self.native.worker_threads as u64)?;
        positive("native.max_chunk_size", self.native.max_chunk_size as u64)?;
        if self.native.stream_receive_window < self.native.max_chunk_size as u64 {
            return Err(ConfigError::InvalidValue {
                key: "native.stream_receive_window".to_string(),
                message: "must be at least native.max_chunk_size".to_string(),
            });
        }
        positive("software.worker_threads", self.software.worker_threads as u64)?;

        Ok(())
    }

    /// Apply `GT_TRANSPORT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup` (prefix: GT_TRANSPORT_)
    /// Example keys:
    /// - GT_TRANSPORT_ENGINE, GT_TRANSPORT_ALPN, GT_TRANSPORT_LOG_LEVEL
    /// - GT_TRANSPORT_IDLE_TIMEOUT_MS, GT_TRANSPORT_HANDSHAKE_TIMEOUT_MS, GT_TRANSPORT_KEEP_ALIVE_MS
    /// - GT_TRANSPORT_CONNECTION_BACKLOG, GT_TRANSPORT_STREAM_BACKLOG
    /// - GT_TRANSPORT_NATIVE_WORKER_THREADS, GT_TRANSPORT_NATIVE_STREAM_RECEIVE_WINDOW,
    ///   GT_TRANSPORT_NATIVE_MAX_CHUNK_SIZE, GT_TRANSPORT_SOFTWARE_WORKER_THREADS
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse_usize(s: &str) -> Option<usize> {
            s.trim().parse().ok()
        }
        fn parse_u64(s: &str) -> Option<u64> {
            s.trim().parse().ok()
        }

        // Top-level
        if let Some(v) = lookup("GT_TRANSPORT_ENGINE") {
            if let Ok(kind) = v.parse::<EngineKind>() {
                self.engine = kind;
            }
        }
        if let Some(v) = lookup("GT_TRANSPORT_ALPN") {
            if !v.is_empty() {
                self.alpn = v;
            }
        }
        if let Some(v) = lookup("GT_TRANSPORT_LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }
        if let Some(n) = lookup("GT_TRANSPORT_IDLE_TIMEOUT_MS").and_then(|v| parse_u64(&v)) {
            self.idle_timeout_ms = n;
        }
        if let Some(n) = lookup("GT_TRANSPORT_HANDSHAKE_TIMEOUT_MS").and_then(|v| parse_u64(&v)) {
            self.handshake_timeout_ms = n;
        }
        if let Some(n) = lookup("GT_TRANSPORT_KEEP_ALIVE_MS").and_then(|v| parse_u64(&v)) {
            self.keep_alive_ms = n;
        }
        if let Some(n) = lookup("GT_TRANSPORT_CONNECTION_BACKLOG").and_then(|v| parse_usize(&v)) {
            self.connection_backlog = n;
        }
        if let Some(n) = lookup("GT_TRANSPORT_STREAM_BACKLOG").and_then(|v| parse_usize(&v)) {
            self.stream_backlog = n;
        }

        // Native
        if let Some(n) = lookup("GT_TRANSPORT_NATIVE_WORKER_THREADS").and_then(|v| parse_usize(&v))
        {
            self.native.worker_threads = n;
        }
        if let Some(n) =
            lookup("GT_TRANSPORT_NATIVE_STREAM_RECEIVE_WINDOW").and_then(|v| parse_u64(&v))
        {
            self.native.stream_receive_window = n;
        }
        if let Some(n) = lookup("GT_TRANSPORT_NATIVE_MAX_CHUNK_SIZE").and_then(|v| parse_usize(&v))
        {
            self.native.max_chunk_size = n;
        }

        // Software
        if let Some(n) =
            lookup("GT_TRANSPORT_SOFTWARE_WORKER_THREADS").and_then(|v| parse_usize(&v))
        {
            self.software.worker_threads = n;
        }
    }
}
