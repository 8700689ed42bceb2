use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::{Buf, Bytes};
use gt_native::{Context, NativeError, NativeResult, StreamEvent, StreamHandle};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::connection::ConnectionShared;
use super::native::NativeCore;
use super::registry::{STREAMS, next_context};
use super::signal::{CloseSignal, Handoff, Waited};
use crate::transport::{Entity, Lifecycle, Phase, Stream, TransportError, TransportResult};

enum Inbound {
    Data(Bytes),
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    send_ctx: u64,
    canceled: bool,
}

#[derive(Default)]
struct ReadState {
    /// Unread remainder of the current chunk.
    pending: Bytes,
    /// Full length of the current chunk, acknowledged once it is drained.
    chunk_len: u64,
    finished: bool,
}

/// Event-side state of one native stream.
pub(crate) struct StreamShared {
    core: Arc<dyn NativeCore>,
    pub(crate) context: Context,
    handle: OnceLock<StreamHandle>,
    connection: Arc<ConnectionShared>,
    lifecycle: Lifecycle,
    closed: CloseSignal,
    started: Handoff<NativeResult<()>>,
    inbound: Handoff<Inbound>,
    completions: Handoff<Completion>,
    send_seq: AtomicU64,
    reader: Mutex<ReadState>,
    writer: Mutex<()>,
    released: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl StreamShared {
    /// Builds and registers a stream belonging to `connection`.
    pub(crate) fn register(
        core: Arc<dyn NativeCore>,
        connection: Arc<ConnectionShared>,
    ) -> Arc<StreamShared> {
        let shared = Arc::new(StreamShared {
            core,
            context: next_context(),
            handle: OnceLock::new(),
            connection,
            lifecycle: Lifecycle::default(),
            closed: CloseSignal::new(),
            started: Handoff::bounded(1),
            inbound: Handoff::bounded(1),
            completions: Handoff::bounded(2),
            send_seq: AtomicU64::new(0),
            reader: Mutex::new(ReadState::default()),
            writer: Mutex::new(()),
            released: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        });
        STREAMS.insert(shared.context, Arc::clone(&shared));
        shared
    }

    pub(crate) fn bind(&self, handle: StreamHandle) {
        let _ = self.handle.set(handle);
    }

    pub(crate) fn activate(&self) {
        self.lifecycle.advance(Phase::Active);
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    pub(crate) fn on_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::StartComplete { result } => {
                if self.started.try_offer(result).is_err() {
                    debug!(context = %self.context, "duplicate start completion");
                }
            }
            StreamEvent::Receive { data } => {
                trace!(context = %self.context, len = data.len(), "chunk received");
                if self.inbound.offer(Inbound::Data(data), &self.closed).is_err() {
                    trace!(context = %self.context, "chunk dropped after close");
                }
            }
            StreamEvent::PeerSendShutdown => {
                let _ = self.inbound.offer(Inbound::Finished, &self.closed);
            }
            StreamEvent::SendComplete { send_ctx, canceled } => {
                let completion = Completion { send_ctx, canceled };
                if let Err(completion) = self.completions.try_offer(completion) {
                    // Slot full of stale completions from abandoned writes.
                    let _ = self.completions.try_take();
                    let _ = self.completions.try_offer(completion);
                }
            }
            StreamEvent::ShutdownComplete {
                connection_shutdown,
            } => {
                debug!(context = %self.context, connection_shutdown, "stream shut down by engine");
                self.lifecycle.advance(Phase::Closing);
                self.closed.fire();
            }
        }
    }

    /// Waits for the start completion of a locally opened stream.
    pub(crate) fn wait_started(&self, deadline: Option<Instant>) -> TransportResult<()> {
        match self.started.take(&[&self.closed], deadline) {
            Waited::Ready(Ok(())) => {
                self.activate();
                Ok(())
            }
            Waited::Ready(Err(err)) => Err(TransportError::Engine(err.to_string())),
            Waited::Closed => Err(TransportError::Closed(Entity::Connection)),
            Waited::TimedOut => Err(TransportError::Timeout),
        }
    }

    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock();
        if self.lifecycle.phase() == Phase::Closed {
            return Ok(0);
        }

        while reader.pending.is_empty() {
            if reader.finished {
                return Ok(0);
            }
            match self
                .inbound
                .take(&[&self.closed], self.connection.deadlines.read())
            {
                Waited::Ready(Inbound::Data(chunk)) => {
                    reader.chunk_len = chunk.len() as u64;
                    reader.pending = chunk;
                    if reader.chunk_len == 0 {
                        self.acknowledge(0);
                    }
                }
                Waited::Ready(Inbound::Finished) | Waited::Closed => {
                    reader.finished = true;
                    return Ok(0);
                }
                Waited::TimedOut => return Err(TransportError::Timeout),
            }
        }

        let n = buf.len().min(reader.pending.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        if reader.pending.is_empty() {
            let len = reader.chunk_len;
            self.acknowledge(len);
        }
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn acknowledge(&self, len: u64) {
        if let Some(handle) = self.handle.get() {
            self.core.stream_receive_complete(*handle, len);
        }
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        let _writer = self.writer.lock();
        if self.closed.is_fired() {
            return Err(TransportError::Closed(Entity::Stream));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let handle = *self
            .handle
            .get()
            .ok_or(TransportError::Closed(Entity::Stream))?;

        let seq = self.send_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.core
            .stream_send(handle, Bytes::copy_from_slice(buf), seq)
            .map_err(|err| match err {
                NativeError::Shutdown | NativeError::InvalidHandle(_) => {
                    TransportError::Closed(Entity::Stream)
                }
                other => TransportError::Engine(other.to_string()),
            })?;

        let deadline = self.connection.deadlines.write();
        loop {
            match self.completions.take(&[&self.closed], deadline) {
                Waited::Ready(done) if done.send_ctx == seq => {
                    if done.canceled {
                        return Err(TransportError::Closed(Entity::Stream));
                    }
                    self.bytes_written
                        .fetch_add(buf.len() as u64, Ordering::Relaxed);
                    return Ok(buf.len());
                }
                Waited::Ready(stale) => {
                    trace!(context = %self.context, send_ctx = stale.send_ctx, "stale send completion");
                }
                Waited::Closed => return Err(TransportError::Closed(Entity::Stream)),
                Waited::TimedOut => return Err(TransportError::Timeout),
            }
        }
    }

    /// Runs the close sequence once: fire, unregister, release the handle.
    pub(crate) fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lifecycle.advance(Phase::Closing);
        self.closed.fire();
        STREAMS.remove(self.context);
        if let Some(handle) = self.handle.get() {
            self.core.stream_close(*handle);
        }
        self.lifecycle.advance(Phase::Closed);
        debug!(
            context = %self.context,
            read = self.bytes_read.load(Ordering::Relaxed),
            written = self.bytes_written.load(Ordering::Relaxed),
            "stream closed"
        );
    }
}

/// Blocking stream over a native engine stream handle.
pub struct NativeStream {
    pub(crate) shared: Arc<StreamShared>,
}

impl NativeStream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        NativeStream { shared }
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }
}

impl Stream for NativeStream {
    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        self.shared.read(buf)
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        self.shared.write(buf)
    }

    fn close(&self) {
        self.shared.close()
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.connection.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.shared.connection.peer_addr()
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.shared.connection.deadlines.set(deadline);
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared.connection.deadlines.set_read(deadline);
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared.connection.deadlines.set_write(deadline);
    }
}

impl Drop for NativeStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}
