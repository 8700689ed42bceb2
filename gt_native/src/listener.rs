use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use quinn::Endpoint;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::Shared;
use crate::error::{NativeError, NativeResult};
use crate::event::{Context, ListenerEvent, ListenerHandle};
use crate::settings::ListenerSettings;

pub(crate) struct ListenerSlot {
    pub(crate) handle: ListenerHandle,
    context: AtomicU64,
    pub(crate) endpoint: Endpoint,
    local_addr: SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ListenerSlot {
    pub(crate) fn context(&self) -> Context {
        Context(self.context.load(Ordering::Acquire))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Shared {
    pub(crate) fn listener_open(
        self: &Arc<Self>,
        addr: SocketAddr,
        settings: ListenerSettings,
        context: Context,
    ) -> NativeResult<ListenerHandle> {
        let _guard = self.runtime.enter();
        let endpoint = Endpoint::server(settings.server_config, addr)
            .map_err(|source| NativeError::Bind { addr, source })?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|source| NativeError::Bind { addr, source })?;

        let handle = ListenerHandle(self.next_handle());
        let slot = Arc::new(ListenerSlot {
            handle,
            context: AtomicU64::new(context.0),
            endpoint,
            local_addr,
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        self.listeners.insert(handle.0, Arc::clone(&slot));

        let task = self
            .runtime
            .spawn(Arc::clone(self).accept_loop(Arc::clone(&slot)));
        *slot.accept_task.lock() = Some(task);

        info!(listener = %handle, %local_addr, "listener started");
        Ok(handle)
    }

    pub(crate) fn listener_local_addr(&self, listener: ListenerHandle) -> NativeResult<SocketAddr> {
        Ok(self.listener_slot(listener)?.local_addr)
    }

    pub(crate) fn listener_close(&self, listener: ListenerHandle) {
        let Some((_, slot)) = self.listeners.remove(&listener.0) else {
            debug!(%listener, "close on released listener");
            return;
        };
        slot.endpoint.set_server_config(None);
        if let Some(task) = slot.accept_task.lock().take() {
            task.abort();
        }
        self.stop_listener(&slot);
    }

    async fn accept_loop(self: Arc<Self>, slot: Arc<ListenerSlot>) {
        while let Some(incoming) = slot.endpoint.accept().await {
            if slot.is_stopped() {
                incoming.refuse();
                break;
            }
            let shared = Arc::clone(&self);
            let listener = Arc::clone(&slot);
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                match incoming.await {
                    Ok(connection) => shared.on_inbound(&listener, connection),
                    Err(err) => {
                        debug!(listener = %listener.handle, %remote, error = %err, "inbound handshake failed")
                    }
                }
            });
        }
        self.stop_listener(&slot);
    }

    fn stop_listener(&self, slot: &ListenerSlot) {
        if slot.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(listener = %slot.handle, "listener stopped");
        self.emit_listener(slot, ListenerEvent::StopComplete);
    }

    /// Hands a freshly handshaken connection to the listener's owner.
    fn on_inbound(self: &Arc<Self>, listener: &Arc<ListenerSlot>, connection: quinn::Connection) {
        let remote = connection.remote_address();
        if listener.is_stopped() {
            connection.close(0u32.into(), b"listener closed");
            return;
        }

        let slot = self.register_inbound(listener, connection.clone());
        debug!(listener = %listener.handle, connection = %slot.handle, %remote, "peer connected");
        self.emit_listener(
            listener,
            ListenerEvent::NewConnection {
                connection: slot.handle,
                remote,
            },
        );

        if slot.context().is_none() {
            warn!(connection = %slot.handle, %remote, "connection was not adopted, closing");
            self.connections.remove(&slot.handle.0);
            connection.close(0u32.into(), b"not accepted");
            return;
        }
        if !self.connections.contains_key(&slot.handle.0) {
            return;
        }
        self.drive_connection(&slot, connection);
    }
}
