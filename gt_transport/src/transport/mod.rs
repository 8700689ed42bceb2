//! Transport abstraction layer.
//!
//! Defines the blocking [`Stream`], [`Connection`] and [`Listener`] contracts
//! every engine satisfies, the error taxonomy shared by all of them, and the
//! small state holders (deadlines, lifecycle) the implementations embed.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

use crate::engine::Tunnel;

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Stream,
    Connection,
    Listener,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Stream => write!(f, "stream"),
            Entity::Connection => write!(f, "connection"),
            Entity::Listener => write!(f, "listener"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial or handshake failure
    #[error("Connection error: {0}")]
    Connect(String),

    /// The listener could not bind or be configured
    #[error("Listen error: {0}")]
    Listen(String),

    /// The entity was closed locally or by the peer
    #[error("The {0} is closed")]
    Closed(Entity),

    /// A deadline or the handshake timeout expired
    #[error("Operation timed out")]
    Timeout,

    /// TLS material could not be used
    #[error("TLS error: {0}")]
    Tls(String),

    /// Address resolution failure
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Engine level failure on one entity
    #[error("Engine error: {0}")]
    Engine(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(err) => err,
            TransportError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            TransportError::Closed(_) => io::Error::new(io::ErrorKind::BrokenPipe, err),
            TransportError::Connect(_) => io::Error::new(io::ErrorKind::ConnectionRefused, err),
            other => io::Error::other(other),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional, ordered, reliable byte stream.
///
/// Reads and writes may be issued from different threads at the same time;
/// concurrent reads (or concurrent writes) are serialized.
pub trait Stream: Send + Sync {
    /// Reads into `buf`. Returns `Ok(0)` at end of stream, which includes a
    /// stream closed locally or by its connection.
    fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Sends the whole buffer and waits for the engine to accept it.
    fn write(&self, buf: &[u8]) -> TransportResult<usize>;

    /// Closes the stream. Idempotent and infallible.
    fn close(&self);

    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;

    /// Sets both deadlines on the owning connection.
    fn set_deadline(&self, deadline: Option<Instant>);

    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);

    /// Fills `buf` completely or fails with `UnexpectedEof`.
    fn read_exact(&self, mut buf: &mut [u8]) -> TransportResult<()> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended before the buffer was filled",
                    )
                    .into());
                }
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }
}

/// A QUIC connection multiplexing streams.
pub trait Connection: Send + Sync {
    /// Opens a locally initiated bidirectional stream.
    fn open_stream(&self) -> TransportResult<Box<dyn Stream>>;

    /// Waits for the next peer-initiated stream, in arrival order.
    fn accept_stream(&self) -> TransportResult<Box<dyn Stream>>;

    /// Closes the connection. Idempotent and infallible.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;

    fn set_deadline(&self, deadline: Option<Instant>);

    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);
}

/// A bound listener handing out inbound connections.
pub trait Listener: Send + Sync {
    /// Waits for the next inbound connection and its first peer stream.
    fn accept(&self) -> TransportResult<Tunnel>;

    /// Stops accepting. Idempotent and infallible.
    fn close(&self);

    fn local_addr(&self) -> SocketAddr;
}

/// Read and write deadlines of a connection.
#[derive(Debug, Default)]
pub struct Deadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
}

impl Deadlines {
    pub fn set(&self, deadline: Option<Instant>) {
        *self.read.lock() = deadline;
        *self.write.lock() = deadline;
    }

    pub fn set_read(&self, deadline: Option<Instant>) {
        *self.read.lock() = deadline;
    }

    pub fn set_write(&self, deadline: Option<Instant>) {
        *self.write.lock() = deadline;
    }

    pub fn read(&self) -> Option<Instant> {
        *self.read.lock()
    }

    pub fn write(&self) -> Option<Instant> {
        *self.write.lock()
    }
}

/// Lifecycle phase of a stream, connection or listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Created = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Created,
            1 => Phase::Active,
            2 => Phase::Closing,
            _ => Phase::Closed,
        }
    }
}

/// Forward-only phase tracker. Nothing leaves `Closed`.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new(phase: Phase) -> Self {
        Lifecycle(AtomicU8::new(phase as u8))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `to` if it lies ahead of the current phase.
    pub fn advance(&self, to: Phase) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (to as u8 > current).then_some(to as u8)
            })
            .is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new(Phase::Created)
    }
}
