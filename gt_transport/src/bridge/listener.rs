use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use gt_native::{Context, ListenerEvent, ListenerHandle, ListenerSettings};
use tracing::{debug, info, warn};

use super::connection::{ConnectionShared, NativeConnection};
use super::native::NativeCore;
use super::registry::{LISTENERS, next_context};
use super::signal::{CloseSignal, Handoff, Waited};
use super::stream::NativeStream;
use crate::engine::Tunnel;
use crate::transport::{Entity, Lifecycle, Listener, Phase, TransportError, TransportResult};

/// Event-side state of one native listener.
pub(crate) struct ListenerShared {
    core: Arc<dyn NativeCore>,
    context: Context,
    handle: OnceLock<ListenerHandle>,
    lifecycle: Lifecycle,
    closed: CloseSignal,
    incoming: Handoff<Arc<ConnectionShared>>,
    stream_backlog: usize,
    local_addr: OnceLock<SocketAddr>,
    released: AtomicBool,
}

impl ListenerShared {
    pub(crate) fn on_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::NewConnection { connection, remote } => {
                if self.released.load(Ordering::Acquire) {
                    return;
                }
                let inbound = match ConnectionShared::adopt(
                    Arc::clone(&self.core),
                    connection,
                    self.stream_backlog,
                ) {
                    Ok(inbound) => inbound,
                    Err(err) => {
                        warn!(context = %self.context, %remote, error = %err, "failed to adopt connection");
                        return;
                    }
                };
                debug!(context = %self.context, %remote, connection = %inbound.context, "inbound connection queued");
                if let Err(inbound) = self.incoming.offer(inbound, &self.closed) {
                    debug!(context = %self.context, %remote, "listener closed before accept");
                    inbound.close();
                }
            }
            ListenerEvent::StopComplete => {
                self.lifecycle.advance(Phase::Closed);
                self.closed.fire();
            }
        }
    }

    fn accept(&self) -> TransportResult<Tunnel> {
        loop {
            if self.released.load(Ordering::Acquire) {
                return Err(TransportError::Closed(Entity::Listener));
            }
            let connection = match self.incoming.take(&[&self.closed], None) {
                Waited::Ready(shared) => NativeConnection::new(shared),
                Waited::Closed | Waited::TimedOut => {
                    return Err(TransportError::Closed(Entity::Listener));
                }
            };

            // The tunnel is the connection's first peer stream.
            match connection.shared.take_peer_stream(Some(&self.closed), None) {
                Waited::Ready(stream) => {
                    if self.released.load(Ordering::Acquire) {
                        stream.close();
                        return Err(TransportError::Closed(Entity::Listener));
                    }
                    info!(
                        context = %self.context,
                        peer = %connection.shared.peer_addr(),
                        "accepted tunnel"
                    );
                    return Ok(Tunnel::new(
                        Box::new(NativeStream::new(stream)),
                        Arc::new(connection),
                    ));
                }
                Waited::Closed | Waited::TimedOut => {
                    if self.closed.is_fired() {
                        return Err(TransportError::Closed(Entity::Listener));
                    }
                    warn!(
                        context = %self.context,
                        peer = %connection.shared.peer_addr(),
                        reason = ?connection.shared.shutdown_reason(),
                        "connection closed before opening a stream, skipping"
                    );
                }
            }
        }
    }

    pub(crate) fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lifecycle.advance(Phase::Closing);
        self.closed.fire();
        LISTENERS.remove(self.context);
        if let Some(handle) = self.handle.get() {
            self.core.listener_close(*handle);
        }
        for pending in self.incoming.drain() {
            pending.close();
        }
        self.lifecycle.advance(Phase::Closed);
        info!(context = %self.context, "listener closed");
    }
}

/// Blocking listener over a native engine listener handle.
pub struct NativeListener {
    shared: Arc<ListenerShared>,
}

impl NativeListener {
    /// Binds `addr` and starts accepting.
    pub(crate) fn open(
        core: &Arc<dyn NativeCore>,
        addr: SocketAddr,
        settings: ListenerSettings,
        connection_backlog: usize,
        stream_backlog: usize,
    ) -> TransportResult<NativeListener> {
        let shared = Arc::new(ListenerShared {
            core: Arc::clone(core),
            context: next_context(),
            handle: OnceLock::new(),
            lifecycle: Lifecycle::default(),
            closed: CloseSignal::new(),
            incoming: Handoff::bounded(connection_backlog),
            stream_backlog,
            local_addr: OnceLock::new(),
            released: AtomicBool::new(false),
        });
        LISTENERS.insert(shared.context, Arc::clone(&shared));
        let listener = NativeListener { shared };

        let handle = core
            .listener_open(addr, settings, listener.shared.context)
            .map_err(|err| TransportError::Listen(err.to_string()))?;
        let _ = listener.shared.handle.set(handle);
        let local_addr = core
            .listener_local_addr(handle)
            .map_err(|err| TransportError::Listen(err.to_string()))?;
        let _ = listener.shared.local_addr.set(local_addr);
        listener.shared.lifecycle.advance(Phase::Active);

        info!(context = %listener.shared.context, %local_addr, "listening");
        Ok(listener)
    }

    pub fn phase(&self) -> Phase {
        self.shared.lifecycle.phase()
    }
}

impl Listener for NativeListener {
    fn accept(&self) -> TransportResult<Tunnel> {
        self.shared.accept()
    }

    fn close(&self) {
        self.shared.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared
            .local_addr
            .get()
            .copied()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

impl Drop for NativeListener {
    fn drop(&mut self) {
        self.shared.close();
    }
}
