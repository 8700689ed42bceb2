use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use quinn::Endpoint;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Shared;
use crate::error::{NativeError, NativeResult};
use crate::event::{
    ConnectionEvent, ConnectionHandle, Context, ShutdownReason, StreamHandle,
};
use crate::listener::ListenerSlot;
use crate::settings::ClientSettings;

pub(crate) struct ConnectionSlot {
    pub(crate) handle: ConnectionHandle,
    context: AtomicU64,
    pub(crate) connection: OnceLock<quinn::Connection>,
    endpoint: Mutex<Option<Endpoint>>,
    pub(crate) streams: Mutex<Vec<StreamHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl ConnectionSlot {
    fn new(handle: ConnectionHandle, context: Context) -> Self {
        ConnectionSlot {
            handle,
            context: AtomicU64::new(context.0),
            connection: OnceLock::new(),
            endpoint: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn context(&self) -> Context {
        Context(self.context.load(Ordering::Acquire))
    }

    pub(crate) fn set_context(&self, context: Context) {
        self.context.store(context.0, Ordering::Release);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Shared {
    pub(crate) fn register_inbound(
        &self,
        listener: &ListenerSlot,
        connection: quinn::Connection,
    ) -> Arc<ConnectionSlot> {
        let handle = ConnectionHandle(self.next_handle());
        let slot = Arc::new(ConnectionSlot::new(handle, Context::NONE));
        let _ = slot.connection.set(connection);
        *slot.endpoint.lock() = Some(listener.endpoint.clone());
        self.connections.insert(handle.0, Arc::clone(&slot));
        slot
    }

    pub(crate) fn connection_open(&self, context: Context) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle());
        self.connections
            .insert(handle.0, Arc::new(ConnectionSlot::new(handle, context)));
        handle
    }

    pub(crate) fn connection_start(
        self: &Arc<Self>,
        connection: ConnectionHandle,
        addr: SocketAddr,
        settings: ClientSettings,
    ) -> NativeResult<()> {
        let slot = self.connection_slot(connection)?;
        if slot.is_shut_down() {
            return Err(NativeError::Shutdown);
        }
        if slot.connection.get().is_some() || slot.endpoint.lock().is_some() {
            return Err(NativeError::InvalidState("connection already started"));
        }

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let _guard = self.runtime.enter();
        let endpoint =
            Endpoint::client(bind).map_err(|source| NativeError::Bind { addr: bind, source })?;
        let connecting = endpoint
            .connect_with(settings.client_config, addr, &settings.server_name)
            .map_err(|e| NativeError::Connect(e.to_string()))?;
        *slot.endpoint.lock() = Some(endpoint);

        info!(%connection, %addr, server_name = %settings.server_name, "connecting");

        let shared = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        let timeout = settings.handshake_timeout;
        let task = self.runtime.spawn(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(Ok(established)) => {
                    let _ = task_slot.connection.set(established.clone());
                    match shared.connection_addrs(task_slot.handle) {
                        Ok((local, remote)) => {
                            debug!(connection = %task_slot.handle, %local, %remote, "handshake complete");
                            shared.emit_connection(
                                &task_slot,
                                ConnectionEvent::Connected { local, remote },
                            );
                            shared.drive_connection(&task_slot, established);
                        }
                        Err(err) => {
                            established.close(0u32.into(), b"no local address");
                            shared.shutdown_connection(
                                &task_slot,
                                ShutdownReason::Transport(err.to_string()),
                            );
                        }
                    }
                }
                Ok(Err(err)) => {
                    warn!(connection = %task_slot.handle, error = %err, "handshake failed");
                    shared.shutdown_connection(&task_slot, ShutdownReason::from(err));
                }
                Err(_) => {
                    warn!(connection = %task_slot.handle, ?timeout, "handshake timed out");
                    shared.shutdown_connection(&task_slot, ShutdownReason::HandshakeTimeout);
                }
            }
        });
        slot.tasks.lock().push(task);
        Ok(())
    }

    pub(crate) fn connection_addrs(
        &self,
        connection: ConnectionHandle,
    ) -> NativeResult<(SocketAddr, SocketAddr)> {
        let slot = self.connection_slot(connection)?;
        let established = slot
            .connection
            .get()
            .ok_or(NativeError::InvalidState("connection not established"))?;
        let bound = slot
            .endpoint
            .lock()
            .as_ref()
            .ok_or(NativeError::InvalidState("connection has no endpoint"))?
            .local_addr()
            .map_err(|e| NativeError::Connect(e.to_string()))?;
        let local = match established.local_ip() {
            Some(ip) => SocketAddr::new(ip, bound.port()),
            None => bound,
        };
        Ok((local, established.remote_address()))
    }

    /// Starts the peer stream acceptor and the close watcher.
    pub(crate) fn drive_connection(
        self: &Arc<Self>,
        slot: &Arc<ConnectionSlot>,
        connection: quinn::Connection,
    ) {
        if slot.is_shut_down() {
            return;
        }

        let acceptor = {
            let shared = Arc::clone(self);
            let slot = Arc::clone(slot);
            let connection = connection.clone();
            self.runtime.spawn(async move {
                loop {
                    match connection.accept_bi().await {
                        Ok((send, recv)) => shared.on_peer_stream(&slot, send, recv),
                        Err(err) => {
                            debug!(connection = %slot.handle, error = %err, "stream acceptor stopped");
                            break;
                        }
                    }
                }
            })
        };

        let watcher = {
            let shared = Arc::clone(self);
            let slot = Arc::clone(slot);
            self.runtime.spawn(async move {
                let err = connection.closed().await;
                shared.shutdown_connection(&slot, ShutdownReason::from(err));
            })
        };

        slot.tasks.lock().extend([acceptor, watcher]);
    }

    /// Raises the shutdown sequence once: `ShutdownInitiated`, stream
    /// shutdowns, then `ShutdownComplete`. Runs on the calling thread.
    pub(crate) fn shutdown_connection(&self, slot: &ConnectionSlot, reason: ShutdownReason) {
        if slot.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(connection = %slot.handle, %reason, "connection shutting down");
        self.emit_connection(slot, ConnectionEvent::ShutdownInitiated { reason });

        let streams = slot.streams.lock().clone();
        for stream in streams {
            if let Ok(stream_slot) = self.stream_slot(stream) {
                self.shutdown_stream(&stream_slot, true);
            }
        }
        self.emit_connection(slot, ConnectionEvent::ShutdownComplete);
    }

    pub(crate) fn connection_close(&self, connection: ConnectionHandle) {
        let Some((_, slot)) = self.connections.remove(&connection.0) else {
            debug!(%connection, "close on released connection");
            return;
        };
        for task in slot.tasks.lock().drain(..) {
            task.abort();
        }
        // Shutdown events go out before the transport close so the watcher
        // task cannot race this thread for them.
        self.shutdown_connection(&slot, ShutdownReason::Local);
        if let Some(established) = slot.connection.get() {
            established.close(0u32.into(), b"closed");
        }

        let streams = std::mem::take(&mut *slot.streams.lock());
        for stream in streams {
            self.release_stream(stream);
        }
        slot.endpoint.lock().take();
        debug!(%connection, "connection released");
    }
}
