//! Engine instance and the command surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::{debug, info, trace};

use crate::connection::ConnectionSlot;
use crate::error::{NativeError, NativeResult};
use crate::event::{
    ConnectionEvent, ConnectionHandle, Context, EventHandler, ListenerEvent, ListenerHandle,
    StreamEvent, StreamHandle,
};
use crate::listener::ListenerSlot;
use crate::settings::{ClientSettings, ListenerSettings, Settings};
use crate::stream::{StreamSlot, StreamStats};

/// State reachable from engine tasks.
///
/// Tasks only ever hold a runtime `Handle`, never the runtime itself, so the
/// last owner of the runtime is always the [`Api`].
pub(crate) struct Shared {
    pub(crate) runtime: Handle,
    pub(crate) settings: Settings,
    handler: Arc<dyn EventHandler>,
    pub(crate) listeners: DashMap<u64, Arc<ListenerSlot>>,
    pub(crate) connections: DashMap<u64, Arc<ConnectionSlot>>,
    pub(crate) streams: DashMap<u64, Arc<StreamSlot>>,
    next_handle: AtomicU64,
}

impl Shared {
    pub(crate) fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn listener_slot(&self, handle: ListenerHandle) -> NativeResult<Arc<ListenerSlot>> {
        self.listeners
            .get(&handle.0)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(NativeError::InvalidHandle(handle.0))
    }

    pub(crate) fn connection_slot(
        &self,
        handle: ConnectionHandle,
    ) -> NativeResult<Arc<ConnectionSlot>> {
        self.connections
            .get(&handle.0)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(NativeError::InvalidHandle(handle.0))
    }

    pub(crate) fn stream_slot(&self, handle: StreamHandle) -> NativeResult<Arc<StreamSlot>> {
        self.streams
            .get(&handle.0)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(NativeError::InvalidHandle(handle.0))
    }

    /// Runs a handler callback. On a multi-threaded runtime worker the call
    /// is wrapped in `block_in_place` since handlers may block.
    fn deliver(&self, call: impl FnOnce(&dyn EventHandler)) {
        let handler = self.handler.as_ref();
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| call(handler)),
            _ => call(handler),
        }
    }

    pub(crate) fn emit_listener(&self, slot: &ListenerSlot, event: ListenerEvent) {
        let context = slot.context();
        if context.is_none() {
            trace!(listener = %slot.handle, ?event, "dropping event without context");
            return;
        }
        self.deliver(|handler| handler.on_listener_event(context, slot.handle, event));
    }

    pub(crate) fn emit_connection(&self, slot: &ConnectionSlot, event: ConnectionEvent) {
        let context = slot.context();
        if context.is_none() {
            trace!(connection = %slot.handle, ?event, "dropping event without context");
            return;
        }
        self.deliver(|handler| handler.on_connection_event(context, slot.handle, event));
    }

    pub(crate) fn emit_stream(&self, slot: &StreamSlot, event: StreamEvent) {
        let context = slot.context();
        if context.is_none() {
            trace!(stream = %slot.handle, ?event, "dropping event without context");
            return;
        }
        self.deliver(|handler| handler.on_stream_event(context, slot.handle, event));
    }
}

/// An open engine instance.
///
/// All commands are synchronous and may be called from any thread that is
/// not itself driving an async runtime. Events are delivered to the handler
/// given to [`Api::open`].
pub struct Api {
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
}

impl Api {
    /// Starts the engine workers.
    pub fn open(settings: Settings, handler: Arc<dyn EventHandler>) -> NativeResult<Api> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(settings.worker_threads.max(1))
            .thread_name(settings.thread_name.clone())
            .enable_all()
            .build()
            .map_err(NativeError::Runtime)?;

        info!(
            workers = settings.worker_threads.max(1),
            window = settings.stream_receive_window,
            "native engine started"
        );

        let shared = Arc::new(Shared {
            runtime: runtime.handle().clone(),
            settings,
            handler,
            listeners: DashMap::new(),
            connections: DashMap::new(),
            streams: DashMap::new(),
            next_handle: AtomicU64::new(1),
        });

        Ok(Api {
            runtime: Some(runtime),
            shared,
        })
    }

    /// Settings the engine was opened with.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn listener_open(
        &self,
        addr: SocketAddr,
        settings: ListenerSettings,
        context: Context,
    ) -> NativeResult<ListenerHandle> {
        self.shared.listener_open(addr, settings, context)
    }

    pub fn listener_local_addr(&self, listener: ListenerHandle) -> NativeResult<SocketAddr> {
        self.shared.listener_local_addr(listener)
    }

    /// Stops accepting and releases the listener. `StopComplete` is
    /// delivered before this returns if a context is still attached.
    pub fn listener_close(&self, listener: ListenerHandle) {
        self.shared.listener_close(listener)
    }

    /// Allocates a client connection handle. Nothing is sent until
    /// [`Api::connection_start`].
    pub fn connection_open(&self, context: Context) -> ConnectionHandle {
        self.shared.connection_open(context)
    }

    pub fn connection_start(
        &self,
        connection: ConnectionHandle,
        addr: SocketAddr,
        settings: ClientSettings,
    ) -> NativeResult<()> {
        self.shared.connection_start(connection, addr, settings)
    }

    pub fn connection_set_context(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<()> {
        self.shared.connection_slot(connection)?.set_context(context);
        Ok(())
    }

    /// Local and remote address of an established connection.
    pub fn connection_addrs(
        &self,
        connection: ConnectionHandle,
    ) -> NativeResult<(SocketAddr, SocketAddr)> {
        self.shared.connection_addrs(connection)
    }

    /// Closes the connection and releases it with all of its streams.
    /// Shutdown events are delivered before this returns.
    pub fn connection_close(&self, connection: ConnectionHandle) {
        self.shared.connection_close(connection)
    }

    pub fn stream_open(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<StreamHandle> {
        self.shared.stream_open(connection, context)
    }

    /// Starts a stream opened with [`Api::stream_open`]. Completion is
    /// reported with `StreamEvent::StartComplete`.
    pub fn stream_start(&self, stream: StreamHandle) -> NativeResult<()> {
        self.shared.stream_start(stream)
    }

    pub fn stream_set_context(&self, stream: StreamHandle, context: Context) -> NativeResult<()> {
        self.shared.stream_slot(stream)?.set_context(context);
        Ok(())
    }

    /// Queues `data` for sending. `SendComplete` carries `send_ctx` back.
    pub fn stream_send(&self, stream: StreamHandle, data: Bytes, send_ctx: u64) -> NativeResult<()> {
        self.shared.stream_send(stream, data, send_ctx)
    }

    /// Acknowledges `len` received bytes, reopening the receive window.
    pub fn stream_receive_complete(&self, stream: StreamHandle, len: u64) {
        self.shared.stream_receive_complete(stream, len)
    }

    /// Finishes the sending direction gracefully and releases the stream.
    pub fn stream_close(&self, stream: StreamHandle) {
        self.shared.release_stream(stream)
    }

    pub fn stream_stats(&self, stream: StreamHandle) -> NativeResult<StreamStats> {
        Ok(self.shared.stream_slot(stream)?.stats())
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        let listeners: Vec<u64> = self.shared.listeners.iter().map(|e| *e.key()).collect();
        for id in listeners {
            self.shared.listener_close(ListenerHandle(id));
        }
        let connections: Vec<u64> = self.shared.connections.iter().map(|e| *e.key()).collect();
        for id in connections {
            self.shared.connection_close(ConnectionHandle(id));
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("native engine stopped");
    }
}
