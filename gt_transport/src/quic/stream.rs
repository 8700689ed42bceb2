use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use quinn::{RecvStream, SendStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::runtime::{EngineRuntime, until};
use crate::transport::{Deadlines, Entity, Stream, TransportError, TransportResult};

/// Blocking stream over a `quinn` bidirectional stream.
pub struct QuicStream {
    runtime: Arc<EngineRuntime>,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    /// Child of the connection's token
    closed: CancellationToken,
    deadlines: Arc<Deadlines>,
    local: SocketAddr,
    peer: SocketAddr,
    released: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl QuicStream {
    pub(crate) fn new(
        runtime: Arc<EngineRuntime>,
        (send, recv): (SendStream, RecvStream),
        closed: CancellationToken,
        deadlines: Arc<Deadlines>,
        (local, peer): (SocketAddr, SocketAddr),
    ) -> Self {
        QuicStream {
            runtime,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            closed,
            deadlines,
            local,
            peer,
            released: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }
}

impl Stream for QuicStream {
    fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut recv = self.recv.lock();
        if self.closed.is_cancelled() {
            return Ok(0);
        }
        let deadline = self.deadlines.read();
        let outcome = self.runtime.block_on(async {
            tokio::select! {
                _ = self.closed.cancelled() => Some(Ok(None)),
                read = until(deadline, recv.read(buf)) => read,
            }
        });
        match outcome {
            Some(Ok(Some(n))) => {
                self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Some(Ok(None)) => Ok(0),
            Some(Err(err)) => {
                // A reset or lost connection ends the stream.
                debug!(peer = %self.peer, error = %err, "stream read ended");
                Ok(0)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        let mut send = self.send.lock();
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed(Entity::Stream));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.deadlines.write();
        let outcome = self.runtime.block_on(async {
            tokio::select! {
                _ = self.closed.cancelled() => None,
                written = until(deadline, send.write_all(buf)) => Some(written),
            }
        });
        match outcome {
            Some(Some(Ok(()))) => {
                trace!(peer = %self.peer, len = buf.len(), "chunk sent");
                self.bytes_written
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                Ok(buf.len())
            }
            Some(Some(Err(err))) => {
                debug!(peer = %self.peer, error = %err, "stream write failed");
                Err(TransportError::Closed(Entity::Stream))
            }
            Some(None) => Err(TransportError::Timeout),
            None => Err(TransportError::Closed(Entity::Stream)),
        }
    }

    fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        // Blocked callers leave their lock once the token fires.
        let _ = self.send.lock().finish();
        let _ = self.recv.lock().stop(0u32.into());
        debug!(
            peer = %self.peer,
            read = self.bytes_read.load(Ordering::Relaxed),
            written = self.bytes_written.load(Ordering::Relaxed),
            "stream closed"
        );
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
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

impl Drop for QuicStream {
    fn drop(&mut self) {
        self.close();
    }
}
