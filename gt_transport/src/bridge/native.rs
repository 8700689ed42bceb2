use std::net::SocketAddr;

use bytes::Bytes;
use gt_native::{
    Api, ClientSettings, ConnectionEvent, ConnectionHandle, Context, EventHandler, ListenerEvent,
    ListenerHandle, ListenerSettings, NativeResult, StreamEvent, StreamHandle,
};
use tracing::trace;

use super::registry::{CONNECTIONS, LISTENERS, STREAMS};

/// Command surface of the native engine as seen by the bridge.
pub trait NativeCore: Send + Sync + 'static {
    fn listener_open(
        &self,
        addr: SocketAddr,
        settings: ListenerSettings,
        context: Context,
    ) -> NativeResult<ListenerHandle>;
    fn listener_local_addr(&self, listener: ListenerHandle) -> NativeResult<SocketAddr>;
    fn listener_close(&self, listener: ListenerHandle);

    fn connection_open(&self, context: Context) -> ConnectionHandle;
    fn connection_start(
        &self,
        connection: ConnectionHandle,
        addr: SocketAddr,
        settings: ClientSettings,
    ) -> NativeResult<()>;
    fn connection_set_context(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<()>;
    fn connection_addrs(&self, connection: ConnectionHandle)
    -> NativeResult<(SocketAddr, SocketAddr)>;
    fn connection_close(&self, connection: ConnectionHandle);

    fn stream_open(&self, connection: ConnectionHandle, context: Context)
    -> NativeResult<StreamHandle>;
    fn stream_start(&self, stream: StreamHandle) -> NativeResult<()>;
    fn stream_set_context(&self, stream: StreamHandle, context: Context) -> NativeResult<()>;
    fn stream_send(&self, stream: StreamHandle, data: Bytes, send_ctx: u64) -> NativeResult<()>;
    fn stream_receive_complete(&self, stream: StreamHandle, len: u64);
    fn stream_close(&self, stream: StreamHandle);
}

impl NativeCore for Api {
    fn listener_open(
        &self,
        addr: SocketAddr,
        settings: ListenerSettings,
        context: Context,
    ) -> NativeResult<ListenerHandle> {
        Api::listener_open(self, addr, settings, context)
    }

    fn listener_local_addr(&self, listener: ListenerHandle) -> NativeResult<SocketAddr> {
        Api::listener_local_addr(self, listener)
    }

    fn listener_close(&self, listener: ListenerHandle) {
        Api::listener_close(self, listener)
    }

    fn connection_open(&self, context: Context) -> ConnectionHandle {
        Api::connection_open(self, context)
    }

    fn connection_start(
        &self,
        connection: ConnectionHandle,
        addr: SocketAddr,
        settings: ClientSettings,
    ) -> NativeResult<()> {
        Api::connection_start(self, connection, addr, settings)
    }

    fn connection_set_context(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<()> {
        Api::connection_set_context(self, connection, context)
    }

    fn connection_addrs(
        &self,
        connection: ConnectionHandle,
    ) -> NativeResult<(SocketAddr, SocketAddr)> {
        Api::connection_addrs(self, connection)
    }

    fn connection_close(&self, connection: ConnectionHandle) {
        Api::connection_close(self, connection)
    }

    fn stream_open(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<StreamHandle> {
        Api::stream_open(self, connection, context)
    }

    fn stream_start(&self, stream: StreamHandle) -> NativeResult<()> {
        Api::stream_start(self, stream)
    }

    fn stream_set_context(&self, stream: StreamHandle, context: Context) -> NativeResult<()> {
        Api::stream_set_context(self, stream, context)
    }

    fn stream_send(&self, stream: StreamHandle, data: Bytes, send_ctx: u64) -> NativeResult<()> {
        Api::stream_send(self, stream, data, send_ctx)
    }

    fn stream_receive_complete(&self, stream: StreamHandle, len: u64) {
        Api::stream_receive_complete(self, stream, len)
    }

    fn stream_close(&self, stream: StreamHandle) {
        Api::stream_close(self, stream)
    }
}

/// Routes engine events to the bridge object registered under the event's
/// context. Events for unregistered tokens are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dispatcher;

impl EventHandler for Dispatcher {
    fn on_listener_event(&self, context: Context, listener: ListenerHandle, event: ListenerEvent) {
        match LISTENERS.lookup(context) {
            Some(target) => target.on_event(event),
            None => trace!(%context, %listener, ?event, "listener event after close"),
        }
    }

    fn on_connection_event(
        &self,
        context: Context,
        connection: ConnectionHandle,
        event: ConnectionEvent,
    ) {
        match CONNECTIONS.lookup(context) {
            Some(target) => target.on_event(event),
            None => trace!(%context, %connection, ?event, "connection event after close"),
        }
    }

    fn on_stream_event(&self, context: Context, stream: StreamHandle, event: StreamEvent) {
        match STREAMS.lookup(context) {
            Some(target) => target.on_event(event),
            None => trace!(%context, %stream, "stream event after close"),
        }
    }
}
