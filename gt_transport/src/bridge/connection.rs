use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use gt_native::{
    ClientSettings, ConnectionEvent, ConnectionHandle, Context, NativeError, ShutdownReason,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::native::NativeCore;
use super::registry::{CONNECTIONS, STREAMS};
use super::signal::{CloseSignal, Handoff, Waited};
use super::stream::{NativeStream, StreamShared};
use crate::transport::{
    Connection, Deadlines, Entity, Lifecycle, Phase, Stream, TransportError, TransportResult,
};

/// Extra time granted on top of the engine's own handshake timeout before
/// the bridge stops waiting for the engine's verdict.
const HANDSHAKE_GRACE: Duration = Duration::from_secs(1);

const UNSPECIFIED: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    0,
);

fn connection_error(err: NativeError) -> TransportError {
    match err {
        NativeError::Shutdown | NativeError::InvalidHandle(_) => {
            TransportError::Closed(Entity::Connection)
        }
        other => TransportError::Engine(other.to_string()),
    }
}

/// Event-side state of one native connection.
pub(crate) struct ConnectionShared {
    core: Arc<dyn NativeCore>,
    pub(crate) context: Context,
    handle: OnceLock<ConnectionHandle>,
    lifecycle: Lifecycle,
    pub(crate) closed: CloseSignal,
    connected: Handoff<()>,
    addrs: OnceLock<(SocketAddr, SocketAddr)>,
    reason: Mutex<Option<ShutdownReason>>,
    peer_streams: Handoff<Arc<StreamShared>>,
    pub(crate) deadlines: Deadlines,
    released: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn register(core: Arc<dyn NativeCore>, stream_backlog: usize) -> Arc<Self> {
        let shared = Arc::new(ConnectionShared {
            core,
            context: super::registry::next_context(),
            handle: OnceLock::new(),
            lifecycle: Lifecycle::default(),
            closed: CloseSignal::new(),
            connected: Handoff::bounded(1),
            addrs: OnceLock::new(),
            reason: Mutex::new(None),
            peer_streams: Handoff::bounded(stream_backlog),
            deadlines: Deadlines::default(),
            released: AtomicBool::new(false),
        });
        CONNECTIONS.insert(shared.context, Arc::clone(&shared));
        shared
    }

    /// Takes over an inbound connection announced by a listener. Must run
    /// inside the listener's new-connection callback.
    pub(crate) fn adopt(
        core: Arc<dyn NativeCore>,
        handle: ConnectionHandle,
        stream_backlog: usize,
    ) -> TransportResult<Arc<Self>> {
        let shared = Self::register(Arc::clone(&core), stream_backlog);
        shared.bind(handle);
        if let Err(err) = core.connection_set_context(handle, shared.context) {
            CONNECTIONS.remove(shared.context);
            return Err(connection_error(err));
        }
        match core.connection_addrs(handle) {
            Ok((local, remote)) => shared.set_addrs(local, remote),
            Err(err) => debug!(connection = %handle, error = %err, "addresses unavailable"),
        }
        shared.lifecycle.advance(Phase::Active);
        Ok(shared)
    }

    pub(crate) fn bind(&self, handle: ConnectionHandle) {
        let _ = self.handle.set(handle);
    }

    fn set_addrs(&self, local: SocketAddr, remote: SocketAddr) {
        let _ = self.addrs.set((local, remote));
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addrs.get().map_or(UNSPECIFIED, |addrs| addrs.0)
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.addrs.get().map_or(UNSPECIFIED, |addrs| addrs.1)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    pub(crate) fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    pub(crate) fn on_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { local, remote } => {
                self.set_addrs(local, remote);
                self.lifecycle.advance(Phase::Active);
                let _ = self.connected.try_offer(());
            }
            ConnectionEvent::PeerStreamStarted { stream } => {
                if self.released.load(Ordering::Acquire) {
                    return;
                }
                let peer = StreamShared::register(Arc::clone(&self.core), Arc::clone(self));
                peer.bind(stream);
                if let Err(err) = self.core.stream_set_context(stream, peer.context) {
                    warn!(context = %self.context, %stream, error = %err, "peer stream vanished");
                    STREAMS.remove(peer.context);
                    return;
                }
                peer.activate();
                if let Err(peer) = self.peer_streams.offer(peer, &self.closed) {
                    debug!(context = %self.context, %stream, "connection closed before the peer stream was accepted");
                    peer.close();
                }
            }
            ConnectionEvent::ShutdownInitiated { reason } => {
                info!(context = %self.context, %reason, "connection shutting down");
                *self.reason.lock() = Some(reason);
                self.lifecycle.advance(Phase::Closing);
                self.closed.fire();
            }
            ConnectionEvent::ShutdownComplete => {
                self.lifecycle.advance(Phase::Closed);
                self.closed.fire();
            }
        }
    }

    fn wait_connected(&self, deadline: Instant) -> TransportResult<()> {
        match self.connected.take(&[&self.closed], Some(deadline)) {
            Waited::Ready(()) => Ok(()),
            Waited::Closed => match self.shutdown_reason() {
                Some(ShutdownReason::HandshakeTimeout) => Err(TransportError::Timeout),
                Some(reason) => Err(TransportError::Connect(reason.to_string())),
                None => Err(TransportError::Connect(
                    "connection closed during handshake".to_string(),
                )),
            },
            Waited::TimedOut => Err(TransportError::Timeout),
        }
    }

    /// Waits for the next queued peer stream, also giving up when `extra`
    /// fires.
    pub(crate) fn take_peer_stream(
        &self,
        extra: Option<&CloseSignal>,
        deadline: Option<Instant>,
    ) -> Waited<Arc<StreamShared>> {
        match extra {
            Some(extra) => self.peer_streams.take(&[&self.closed, extra], deadline),
            None => self.peer_streams.take(&[&self.closed], deadline),
        }
    }

    pub(crate) fn open_stream(self: &Arc<Self>) -> TransportResult<NativeStream> {
        if self.closed.is_fired() {
            return Err(TransportError::Closed(Entity::Connection));
        }
        let handle = *self
            .handle
            .get()
            .ok_or(TransportError::Closed(Entity::Connection))?;

        let stream = NativeStream::new(StreamShared::register(
            Arc::clone(&self.core),
            Arc::clone(self),
        ));
        let stream_handle = self
            .core
            .stream_open(handle, stream.shared.context)
            .map_err(connection_error)?;
        stream.shared.bind(stream_handle);
        self.core
            .stream_start(stream_handle)
            .map_err(connection_error)?;
        stream.shared.wait_started(self.deadlines.write())?;
        debug!(context = %self.context, stream = %stream_handle, "stream opened");
        Ok(stream)
    }

    pub(crate) fn accept_stream(&self) -> TransportResult<NativeStream> {
        if self.released.load(Ordering::Acquire) {
            return Err(TransportError::Closed(Entity::Connection));
        }
        match self.take_peer_stream(None, self.deadlines.read()) {
            Waited::Ready(stream) => Ok(NativeStream::new(stream)),
            Waited::Closed => Err(TransportError::Closed(Entity::Connection)),
            Waited::TimedOut => Err(TransportError::Timeout),
        }
    }

    pub(crate) fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lifecycle.advance(Phase::Closing);
        self.closed.fire();
        CONNECTIONS.remove(self.context);
        if let Some(handle) = self.handle.get() {
            self.core.connection_close(*handle);
        }
        for stream in self.peer_streams.drain() {
            stream.close();
        }
        self.lifecycle.advance(Phase::Closed);
        info!(context = %self.context, peer = %self.peer_addr(), "connection closed");
    }
}

/// Blocking connection over a native engine connection handle.
pub struct NativeConnection {
    pub(crate) shared: Arc<ConnectionShared>,
}

impl NativeConnection {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        NativeConnection { shared }
    }

    /// Dials `addr` and waits for the handshake.
    pub(crate) fn dial(
        core: &Arc<dyn NativeCore>,
        addr: SocketAddr,
        settings: ClientSettings,
        stream_backlog: usize,
    ) -> TransportResult<NativeConnection> {
        let deadline = Instant::now() + settings.handshake_timeout + HANDSHAKE_GRACE;
        let server_name = settings.server_name.clone();
        let connection = NativeConnection::new(ConnectionShared::register(
            Arc::clone(core),
            stream_backlog,
        ));
        let handle = core.connection_open(connection.shared.context);
        connection.shared.bind(handle);
        core.connection_start(handle, addr, settings)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        connection.shared.wait_connected(deadline)?;
        info!(%addr, %server_name, local = %connection.shared.local_addr(), "connected");
        Ok(connection)
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }
}

impl Connection for NativeConnection {
    fn open_stream(&self) -> TransportResult<Box<dyn Stream>> {
        Ok(Box::new(self.shared.open_stream()?))
    }

    fn accept_stream(&self) -> TransportResult<Box<dyn Stream>> {
        Ok(Box::new(self.shared.accept_stream()?))
    }

    fn close(&self) {
        self.shared.close()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_fired()
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr()
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.shared.deadlines.set(deadline);
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.deadlines.set_write(deadline);
    }
}

impl Drop for NativeConnection {
    fn drop(&mut self) {
        self.shared.close();
    }
}
