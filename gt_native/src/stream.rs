use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use quinn::{ReadError, RecvStream, SendStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::api::Shared;
use crate::connection::ConnectionSlot;
use crate::error::{NativeError, NativeResult};
use crate::event::{ConnectionEvent, ConnectionHandle, Context, StreamEvent, StreamHandle};

/// Byte counters of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Bytes delivered in `Receive` events
    pub received: u64,
    /// Bytes acknowledged with `stream_receive_complete`
    pub acknowledged: u64,
    /// Bytes whose send completed
    pub sent: u64,
}

struct PendingSend {
    data: Bytes,
    send_ctx: u64,
}

pub(crate) struct StreamSlot {
    pub(crate) handle: StreamHandle,
    pub(crate) connection: ConnectionHandle,
    context: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<PendingSend>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    unacked: AtomicU64,
    window_open: Notify,
    received: AtomicU64,
    acknowledged: AtomicU64,
    sent: AtomicU64,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl StreamSlot {
    fn new(handle: StreamHandle, connection: ConnectionHandle, context: Context) -> Self {
        StreamSlot {
            handle,
            connection,
            context: AtomicU64::new(context.0),
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
            unacked: AtomicU64::new(0),
            window_open: Notify::new(),
            received: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn context(&self) -> Context {
        Context(self.context.load(Ordering::Acquire))
    }

    pub(crate) fn set_context(&self, context: Context) {
        self.context.store(context.0, Ordering::Release);
    }

    pub(crate) fn stats(&self) -> StreamStats {
        StreamStats {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn register_stream(&self, connection: &ConnectionSlot, context: Context) -> Arc<StreamSlot> {
        let handle = StreamHandle(self.next_handle());
        let slot = Arc::new(StreamSlot::new(handle, connection.handle, context));
        self.streams.insert(handle.0, Arc::clone(&slot));
        connection.streams.lock().push(handle);
        slot
    }

    pub(crate) fn stream_open(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<StreamHandle> {
        let conn = self.connection_slot(connection)?;
        if conn.is_shut_down() {
            return Err(NativeError::Shutdown);
        }
        if conn.connection.get().is_none() {
            return Err(NativeError::InvalidState("connection not established"));
        }
        Ok(self.register_stream(&conn, context).handle)
    }

    pub(crate) fn stream_start(self: &Arc<Self>, stream: StreamHandle) -> NativeResult<()> {
        let slot = self.stream_slot(stream)?;
        let conn = self.connection_slot(slot.connection)?;
        if conn.is_shut_down() {
            return Err(NativeError::Shutdown);
        }
        let established = conn
            .connection
            .get()
            .cloned()
            .ok_or(NativeError::InvalidState("connection not established"))?;
        if slot.started.swap(true, Ordering::AcqRel) {
            return Err(NativeError::InvalidState("stream already started"));
        }

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            match established.open_bi().await {
                Ok((send, recv)) => {
                    if !shared.streams.contains_key(&slot.handle.0) {
                        trace!(stream = %slot.handle, "stream released before start");
                        return;
                    }
                    shared.attach_sender(&slot, send);
                    shared.emit_stream(&slot, StreamEvent::StartComplete { result: Ok(()) });
                    shared.spawn_receiver(&slot, recv);
                }
                Err(err) => {
                    debug!(stream = %slot.handle, error = %err, "stream open failed");
                    shared.emit_stream(
                        &slot,
                        StreamEvent::StartComplete {
                            result: Err(NativeError::StreamStart(err.to_string())),
                        },
                    );
                    shared.shutdown_stream(&slot, true);
                }
            }
        });
        Ok(())
    }

    /// Registers a peer-initiated stream and offers it to the connection's
    /// owner. A stream left without a context is released.
    pub(crate) fn on_peer_stream(
        self: &Arc<Self>,
        conn: &Arc<ConnectionSlot>,
        send: SendStream,
        recv: RecvStream,
    ) {
        if conn.is_shut_down() {
            return;
        }
        let slot = self.register_stream(conn, Context::NONE);
        slot.started.store(true, Ordering::Release);
        self.attach_sender(&slot, send);
        trace!(connection = %conn.handle, stream = %slot.handle, "peer stream started");

        self.emit_connection(conn, ConnectionEvent::PeerStreamStarted { stream: slot.handle });
        if slot.context().is_none() {
            debug!(stream = %slot.handle, "peer stream was not adopted");
            self.release_stream(slot.handle);
            return;
        }
        if !self.streams.contains_key(&slot.handle.0) {
            // Closed from inside the callback.
            return;
        }
        self.spawn_receiver(&slot, recv);
    }

    fn attach_sender(self: &Arc<Self>, slot: &Arc<StreamSlot>, send: SendStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        *slot.sender.lock() = Some(tx);
        self.runtime
            .spawn(Arc::clone(self).send_pump(Arc::clone(slot), send, rx));
    }

    fn spawn_receiver(self: &Arc<Self>, slot: &Arc<StreamSlot>, recv: RecvStream) {
        let task = self
            .runtime
            .spawn(Arc::clone(self).receive_pump(Arc::clone(slot), recv));
        *slot.receiver.lock() = Some(task);
    }

    async fn send_pump(
        self: Arc<Self>,
        slot: Arc<StreamSlot>,
        mut send: SendStream,
        mut rx: mpsc::UnboundedReceiver<PendingSend>,
    ) {
        while let Some(op) = rx.recv().await {
            let len = op.data.len() as u64;
            match send.write_chunk(op.data).await {
                Ok(()) => {
                    slot.sent.fetch_add(len, Ordering::Relaxed);
                    self.emit_stream(
                        &slot,
                        StreamEvent::SendComplete {
                            send_ctx: op.send_ctx,
                            canceled: false,
                        },
                    );
                }
                Err(err) => {
                    debug!(stream = %slot.handle, error = %err, "send failed");
                    self.emit_stream(
                        &slot,
                        StreamEvent::SendComplete {
                            send_ctx: op.send_ctx,
                            canceled: true,
                        },
                    );
                    rx.close();
                    while let Ok(rest) = rx.try_recv() {
                        self.emit_stream(
                            &slot,
                            StreamEvent::SendComplete {
                                send_ctx: rest.send_ctx,
                                canceled: true,
                            },
                        );
                    }
                    return;
                }
            }
        }
        if let Err(err) = send.finish() {
            trace!(stream = %slot.handle, error = %err, "finish after close");
        }
    }

    async fn receive_pump(self: Arc<Self>, slot: Arc<StreamSlot>, mut recv: RecvStream) {
        let window = self.settings.stream_receive_window.max(1);
        let max_chunk = self.settings.max_chunk_size.max(1);
        loop {
            let room = loop {
                let opened = slot.window_open.notified();
                let unacked = slot.unacked.load(Ordering::Acquire);
                if unacked < window {
                    break window - unacked;
                }
                opened.await;
            };

            let limit = usize::try_from(room).unwrap_or(usize::MAX).min(max_chunk);
            match recv.read_chunk(limit, true).await {
                Ok(Some(chunk)) => {
                    let len = chunk.bytes.len() as u64;
                    slot.unacked.fetch_add(len, Ordering::AcqRel);
                    slot.received.fetch_add(len, Ordering::Relaxed);
                    self.emit_stream(&slot, StreamEvent::Receive { data: chunk.bytes });
                }
                Ok(None) => {
                    trace!(stream = %slot.handle, "peer finished sending");
                    self.emit_stream(&slot, StreamEvent::PeerSendShutdown);
                    return;
                }
                Err(err) => {
                    debug!(stream = %slot.handle, error = %err, "receive failed");
                    let connection_lost = matches!(err, ReadError::ConnectionLost(_));
                    self.shutdown_stream(&slot, connection_lost);
                    return;
                }
            }
        }
    }

    pub(crate) fn stream_send(
        &self,
        stream: StreamHandle,
        data: Bytes,
        send_ctx: u64,
    ) -> NativeResult<()> {
        let slot = self.stream_slot(stream)?;
        if slot.shutdown.load(Ordering::Acquire) {
            return Err(NativeError::Shutdown);
        }
        let sender = slot.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(NativeError::InvalidState("stream not started"));
        };
        tx.send(PendingSend { data, send_ctx })
            .map_err(|_| NativeError::Shutdown)
    }

    pub(crate) fn stream_receive_complete(&self, stream: StreamHandle, len: u64) {
        let Ok(slot) = self.stream_slot(stream) else {
            return;
        };
        let _ = slot
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |unacked| {
                Some(unacked.saturating_sub(len))
            });
        slot.acknowledged.fetch_add(len, Ordering::Relaxed);
        slot.window_open.notify_one();
    }

    pub(crate) fn shutdown_stream(&self, slot: &StreamSlot, connection_shutdown: bool) {
        if slot.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(stream = %slot.handle, connection_shutdown, "stream shut down");
        self.emit_stream(slot, StreamEvent::ShutdownComplete { connection_shutdown });
    }

    /// Removes the stream. Queued sends still drain before the sending
    /// direction is finished.
    pub(crate) fn release_stream(&self, stream: StreamHandle) {
        let Some((_, slot)) = self.streams.remove(&stream.0) else {
            return;
        };
        if let Ok(conn) = self.connection_slot(slot.connection) {
            conn.streams.lock().retain(|h| *h != stream);
        }
        slot.sender.lock().take();
        if let Some(task) = slot.receiver.lock().take() {
            task.abort();
        }
        self.shutdown_stream(&slot, false);
    }
}
