use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use quinn::{ClientConfig, ConnectionError, Endpoint};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runtime::{EngineRuntime, until};
use super::stream::QuicStream;
use crate::transport::{Connection, Deadlines, Entity, Stream, TransportError, TransportResult};

fn stream_error(err: ConnectionError) -> TransportError {
    match err {
        ConnectionError::LocallyClosed
        | ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::Reset
        | ConnectionError::TimedOut => TransportError::Closed(Entity::Connection),
        other => TransportError::Engine(other.to_string()),
    }
}

/// Blocking connection over a `quinn` connection.
pub struct QuicConnection {
    runtime: Arc<EngineRuntime>,
    connection: quinn::Connection,
    /// Client side endpoint, kept alive with the connection. Inbound
    /// connections share their listener's.
    _endpoint: Option<Endpoint>,
    local: SocketAddr,
    closed: CancellationToken,
    deadlines: Arc<Deadlines>,
    released: AtomicBool,
}

impl QuicConnection {
    pub(crate) fn new(
        runtime: Arc<EngineRuntime>,
        connection: quinn::Connection,
        endpoint: Option<Endpoint>,
        local: SocketAddr,
    ) -> Self {
        let closed = CancellationToken::new();

        // Fires the close token when the connection dies for any reason.
        let watched = connection.clone();
        let token = closed.clone();
        runtime.spawn(async move {
            let reason = watched.closed().await;
            debug!(peer = %watched.remote_address(), %reason, "connection terminated");
            token.cancel();
        });

        QuicConnection {
            runtime,
            connection,
            _endpoint: endpoint,
            local,
            closed,
            deadlines: Arc::new(Deadlines::default()),
            released: AtomicBool::new(false),
        }
    }

    /// Dials `remote` from a fresh client endpoint and waits for the
    /// handshake.
    pub(crate) fn dial(
        runtime: Arc<EngineRuntime>,
        remote: SocketAddr,
        server_name: &str,
        config: ClientConfig,
        handshake_timeout: Duration,
    ) -> TransportResult<QuicConnection> {
        info!("Connecting to QUIC server at {}", remote);

        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        // quinn spawns the endpoint and connection drivers on the current
        // runtime, so both calls need the engine's context.
        let (endpoint, connecting) = {
            let _guard = runtime.enter();
            let endpoint = Endpoint::client(bind)
                .map_err(|e| TransportError::Connect(format!("Failed to bind: {e}")))?;
            let connecting = endpoint
                .connect_with(config, remote, server_name)
                .map_err(|e| TransportError::Connect(format!("Failed to connect: {e}")))?;
            (endpoint, connecting)
        };

        let handshake =
            runtime.block_on(async { tokio::time::timeout(handshake_timeout, connecting).await });
        let connection = match handshake {
            Ok(Ok(connection)) => connection,
            Ok(Err(ConnectionError::TimedOut)) | Err(_) => {
                endpoint.close(0u32.into(), b"handshake timeout");
                return Err(TransportError::Timeout);
            }
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
        };
        let local = endpoint.local_addr().unwrap_or(bind);

        info!("Connected to QUIC server at {} from {}", remote, local);
        Ok(QuicConnection::new(runtime, connection, Some(endpoint), local))
    }

    pub(crate) fn stream(&self, pair: (quinn::SendStream, quinn::RecvStream)) -> QuicStream {
        QuicStream::new(
            Arc::clone(&self.runtime),
            pair,
            self.closed.child_token(),
            Arc::clone(&self.deadlines),
            (self.local, self.connection.remote_address()),
        )
    }

    /// Waits for the next peer stream, also stopping when `extra` fires.
    pub(crate) fn accept_bi(
        &self,
        extra: &CancellationToken,
        deadline: Option<Instant>,
    ) -> TransportResult<QuicStream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed(Entity::Connection));
        }
        let outcome = self.runtime.block_on(async {
            tokio::select! {
                _ = self.closed.cancelled() => None,
                _ = extra.cancelled() => None,
                accepted = until(deadline, self.connection.accept_bi()) => Some(accepted),
            }
        });
        match outcome {
            Some(Some(Ok(pair))) => Ok(self.stream(pair)),
            Some(Some(Err(err))) => Err(stream_error(err)),
            Some(None) => Err(TransportError::Timeout),
            None => Err(TransportError::Closed(Entity::Connection)),
        }
    }
}

impl Connection for QuicConnection {
    fn open_stream(&self) -> TransportResult<Box<dyn Stream>> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed(Entity::Connection));
        }
        let deadline = self.deadlines.write();
        let outcome = self.runtime.block_on(async {
            tokio::select! {
                _ = self.closed.cancelled() => None,
                opened = until(deadline, self.connection.open_bi()) => Some(opened),
            }
        });
        match outcome {
            Some(Some(Ok(pair))) => {
                debug!(peer = %self.connection.remote_address(), "opened bidirectional stream");
                Ok(Box::new(self.stream(pair)))
            }
            Some(Some(Err(err))) => Err(stream_error(err)),
            Some(None) => Err(TransportError::Timeout),
            None => Err(TransportError::Closed(Entity::Connection)),
        }
    }

    fn accept_stream(&self) -> TransportResult<Box<dyn Stream>> {
        let never = CancellationToken::new();
        Ok(Box::new(self.accept_bi(&never, self.deadlines.read())?))
    }

    fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        self.connection.close(0u32.into(), b"closed");
        info!(peer = %self.connection.remote_address(), "connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.set(deadline);
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.deadlines.set_write(deadline);
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        self.close();
    }
}
