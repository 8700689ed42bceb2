//! Handles, context tokens and the events delivered to an [`EventHandler`].

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use quinn::ConnectionError;

use crate::error::NativeResult;

/// Opaque token the caller attaches to a handle.
///
/// The engine never interprets it; every event for the handle is delivered
/// together with the token so the caller can route it. `Context::NONE` means
/// no owner is attached and events for the handle are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Context(pub u64);

impl Context {
    /// The empty token.
    pub const NONE: Context = Context(0);

    /// Whether this is the empty token.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Handle to an engine listener.
    ListenerHandle,
    "listener"
);
handle_type!(
    /// Handle to an engine connection.
    ConnectionHandle,
    "connection"
);
handle_type!(
    /// Handle to an engine stream.
    StreamHandle,
    "stream"
);

/// Why a connection went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Closed by the local application
    Local,
    /// Closed by the peer application
    Peer { code: u64, reason: String },
    /// No traffic within the idle timeout
    IdleTimeout,
    /// The handshake did not finish in time
    HandshakeTimeout,
    /// Transport level failure
    Transport(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Local => write!(f, "closed locally"),
            ShutdownReason::Peer { code, reason } => {
                write!(f, "closed by peer (code {code}): {reason}")
            }
            ShutdownReason::IdleTimeout => write!(f, "idle timeout"),
            ShutdownReason::HandshakeTimeout => write!(f, "handshake timeout"),
            ShutdownReason::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl From<ConnectionError> for ShutdownReason {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::LocallyClosed => ShutdownReason::Local,
            ConnectionError::ApplicationClosed(close) => ShutdownReason::Peer {
                code: close.error_code.into_inner(),
                reason: String::from_utf8_lossy(&close.reason).into_owned(),
            },
            ConnectionError::TimedOut => ShutdownReason::IdleTimeout,
            other => ShutdownReason::Transport(other.to_string()),
        }
    }
}

/// Events raised on a listener.
#[derive(Debug)]
pub enum ListenerEvent {
    /// A peer finished its handshake. The handler must attach a context to
    /// the connection before returning, otherwise the engine closes it.
    NewConnection {
        connection: ConnectionHandle,
        remote: SocketAddr,
    },
    /// The listener stopped accepting.
    StopComplete,
}

/// Events raised on a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The client handshake completed.
    Connected {
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// The peer opened a stream. The handler must attach a context to the
    /// stream before returning, otherwise the engine releases it.
    PeerStreamStarted { stream: StreamHandle },
    /// The connection is going down.
    ShutdownInitiated { reason: ShutdownReason },
    /// Teardown finished; no further events follow for this connection.
    ShutdownComplete,
}

/// Events raised on a stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// A locally opened stream is usable (or failed to open).
    StartComplete { result: NativeResult<()> },
    /// Bytes arrived. The receiver acknowledges them with
    /// `stream_receive_complete` once consumed.
    Receive { data: Bytes },
    /// The peer finished its sending direction.
    PeerSendShutdown,
    /// A send submitted with `send_ctx` finished.
    SendComplete { send_ctx: u64, canceled: bool },
    /// Both directions are done; no further events follow for this stream.
    ShutdownComplete { connection_shutdown: bool },
}

/// Receiver of engine events.
///
/// Callbacks run on engine worker threads. They may block briefly (for
/// example on a consumer hand-off); the engine runs them in a blocking
/// section so other handles keep making progress.
pub trait EventHandler: Send + Sync + 'static {
    fn on_listener_event(&self, context: Context, listener: ListenerHandle, event: ListenerEvent);

    fn on_connection_event(
        &self,
        context: Context,
        connection: ConnectionHandle,
        event: ConnectionEvent,
    );

    fn on_stream_event(&self, context: Context, stream: StreamHandle, event: StreamEvent);
}
