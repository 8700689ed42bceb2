//! Error types for the native engine.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for native engine commands.
pub type NativeResult<T> = Result<T, NativeError>;

/// Errors reported synchronously by engine commands or carried by
/// completion events.
#[derive(Debug, Error)]
pub enum NativeError {
    /// The engine worker runtime could not be started
    #[error("Failed to start engine runtime: {0}")]
    Runtime(#[source] io::Error),

    /// A UDP socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The connection attempt was rejected before any packet was sent
    #[error("Connection start failed: {0}")]
    Connect(String),

    /// A locally opened stream could not be started
    #[error("Stream start failed: {0}")]
    StreamStart(String),

    /// The handle is unknown or was already released
    #[error("Unknown handle {0}")]
    InvalidHandle(u64),

    /// The command is not valid in the handle's current state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// The handle has been shut down
    #[error("Handle is shut down")]
    Shutdown,
}
