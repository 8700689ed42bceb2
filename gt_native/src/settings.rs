//! Engine and per-handle settings.

use std::time::Duration;

/// Settings fixed when the engine is opened.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of engine worker threads (default: 2)
    pub worker_threads: usize,

    /// Bytes a stream may hold delivered but unacknowledged (default: 256 KiB)
    pub stream_receive_window: u64,

    /// Largest chunk handed to a single receive event (default: 64 KiB)
    pub max_chunk_size: usize,

    /// Name prefix of the worker threads (default: "gt-native")
    pub thread_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            worker_threads: 2,
            stream_receive_window: 256 * 1024,
            max_chunk_size: 64 * 1024,
            thread_name: "gt-native".to_string(),
        }
    }
}

/// Settings for `listener_open`.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Server crypto and transport parameters
    pub server_config: quinn::ServerConfig,
}

/// Settings for `connection_start`.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Client crypto and transport parameters
    pub client_config: quinn::ClientConfig,

    /// Name presented for SNI and certificate verification
    pub server_name: String,

    /// Upper bound for the handshake
    pub handshake_timeout: Duration,
}
