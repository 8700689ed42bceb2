use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quinn::{Endpoint, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::connection::QuicConnection;
use super::runtime::EngineRuntime;
use crate::engine::Tunnel;
use crate::transport::{Connection, Entity, Listener, TransportError, TransportResult};

/// Blocking listener over a `quinn` server endpoint.
pub struct QuicListener {
    runtime: Arc<EngineRuntime>,
    endpoint: Endpoint,
    local_addr: SocketAddr,
    closed: CancellationToken,
    released: AtomicBool,
}

impl QuicListener {
    pub(crate) fn bind(
        runtime: Arc<EngineRuntime>,
        bind_addr: SocketAddr,
        config: ServerConfig,
    ) -> TransportResult<QuicListener> {
        let endpoint = {
            let _guard = runtime.enter();
            Endpoint::server(config, bind_addr)
                .map_err(|e| TransportError::Listen(format!("{bind_addr}: {e}")))?
        };

        // Get the actual bound address (important when using port 0)
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| TransportError::Listen(e.to_string()))?;
        info!("QUIC server listening on {}", local_addr);

        Ok(QuicListener {
            runtime,
            endpoint,
            local_addr,
            closed: CancellationToken::new(),
            released: AtomicBool::new(false),
        })
    }

    fn closed_error(&self) -> TransportError {
        TransportError::Closed(Entity::Listener)
    }

    /// Waits for the next completed handshake.
    fn next_connection(&self) -> TransportResult<QuicConnection> {
        loop {
            let incoming = self.runtime.block_on(async {
                tokio::select! {
                    _ = self.closed.cancelled() => None,
                    incoming = self.endpoint.accept() => incoming,
                }
            });
            let Some(incoming) = incoming else {
                return Err(self.closed_error());
            };

            let remote = incoming.remote_address();
            let accepted = {
                let _guard = self.runtime.enter();
                incoming.accept()
            };
            let connecting = match accepted {
                Ok(connecting) => connecting,
                Err(e) => {
                    warn!("Error accepting connection from {}: {}", remote, e);
                    continue;
                }
            };
            let handshake = self.runtime.block_on(async {
                tokio::select! {
                    _ = self.closed.cancelled() => None,
                    done = connecting => Some(done),
                }
            });
            match handshake {
                Some(Ok(connection)) => {
                    info!("New connection from {}", connection.remote_address());
                    return Ok(QuicConnection::new(
                        Arc::clone(&self.runtime),
                        connection,
                        None,
                        self.local_addr,
                    ));
                }
                Some(Err(e)) => error!("Error accepting connection from {}: {}", remote, e),
                None => return Err(self.closed_error()),
            }
        }
    }
}

impl Listener for QuicListener {
    fn accept(&self) -> TransportResult<Tunnel> {
        loop {
            if self.closed.is_cancelled() {
                return Err(self.closed_error());
            }
            let connection = self.next_connection()?;

            // The tunnel is the connection's first peer stream.
            match connection.accept_bi(&self.closed, None) {
                Ok(stream) => {
                    info!(peer = %connection.peer_addr(), "accepted tunnel");
                    return Ok(Tunnel::new(Box::new(stream), Arc::new(connection)));
                }
                Err(_) if self.closed.is_cancelled() => {
                    connection.close();
                    return Err(self.closed_error());
                }
                Err(err) => {
                    warn!(
                        peer = %connection.peer_addr(),
                        error = %err,
                        "connection closed before opening a stream, skipping"
                    );
                    connection.close();
                }
            }
        }
    }

    fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        // Refuse new handshakes; accepted connections keep the endpoint.
        self.endpoint.set_server_config(None);
        info!(local = %self.local_addr, "listener closed");
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.close();
    }
}
