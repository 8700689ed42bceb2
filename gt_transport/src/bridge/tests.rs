//! Bridge behaviour against a scripted core that records every command and
//! raises events on demand.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gt_native::{
    ClientSettings, ConnectionEvent, ConnectionHandle, Context, EventHandler, ListenerEvent,
    ListenerHandle, ListenerSettings, NativeError, NativeResult, ShutdownReason, StreamEvent,
    StreamHandle,
};
use parking_lot::Mutex;
use proptest::prelude::*;

use super::connection::NativeConnection;
use super::listener::NativeListener;
use super::native::{Dispatcher, NativeCore};
use super::stream::NativeStream;
use crate::tls::{self, ClientTls, QuicTuning, TlsIdentity};
use crate::transport::{Connection, Entity, Listener, Phase, Stream, TransportError};

const LOCAL: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 4433);
const REMOTE: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 50000);
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Sent {
    stream: u64,
    send_ctx: u64,
    data: Bytes,
}

/// Scripted core: start and send commands complete synchronously through the
/// dispatcher, everything else is raised explicitly by the test.
#[derive(Default)]
struct FakeCore {
    next: AtomicU64,
    listeners: Mutex<HashMap<u64, Context>>,
    connections: Mutex<HashMap<u64, Context>>,
    streams: Mutex<HashMap<u64, (Context, u64)>>,
    sent: Mutex<Vec<Sent>>,
    acks: Mutex<Vec<u64>>,
    closed_streams: Mutex<Vec<u64>>,
    closed_connections: Mutex<Vec<u64>>,
    closed_listeners: Mutex<Vec<u64>>,
    hold_sends: AtomicBool,
    handshake_failure: Mutex<Option<ShutdownReason>>,
}

impl FakeCore {
    fn new() -> Arc<FakeCore> {
        Arc::new(FakeCore {
            next: AtomicU64::new(1),
            ..FakeCore::default()
        })
    }

    fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn stream_handle(&self, context: Context) -> u64 {
        self.streams
            .lock()
            .iter()
            .find(|(_, (ctx, _))| *ctx == context)
            .map(|(handle, _)| *handle)
            .expect("stream registered with the core")
    }

    fn connection_handle(&self, context: Context) -> u64 {
        self.connections
            .lock()
            .iter()
            .find(|(_, ctx)| **ctx == context)
            .map(|(handle, _)| *handle)
            .expect("connection registered with the core")
    }

    fn only_listener(&self) -> u64 {
        *self.listeners.lock().keys().next().expect("listener open")
    }

    fn stream_event(&self, stream: u64, event: StreamEvent) {
        let context = self.streams.lock().get(&stream).map(|(ctx, _)| *ctx);
        if let Some(context) = context {
            Dispatcher.on_stream_event(context, StreamHandle(stream), event);
        }
    }

    fn connection_event(&self, connection: u64, event: ConnectionEvent) {
        let context = self.connections.lock().get(&connection).copied();
        if let Some(context) = context {
            Dispatcher.on_connection_event(context, ConnectionHandle(connection), event);
        }
    }

    fn listener_event(&self, listener: u64, event: ListenerEvent) {
        let context = self.listeners.lock().get(&listener).copied();
        if let Some(context) = context {
            Dispatcher.on_listener_event(context, ListenerHandle(listener), event);
        }
    }

    /// Announces an inbound connection on `listener`.
    fn inbound(&self, listener: u64) -> u64 {
        let connection = self.allocate();
        self.connections.lock().insert(connection, Context::NONE);
        self.listener_event(
            listener,
            ListenerEvent::NewConnection {
                connection: ConnectionHandle(connection),
                remote: REMOTE,
            },
        );
        connection
    }

    /// Announces a peer-initiated stream on `connection`.
    fn peer_stream(&self, connection: u64) -> u64 {
        let stream = self.allocate();
        self.streams
            .lock()
            .insert(stream, (Context::NONE, connection));
        self.connection_event(
            connection,
            ConnectionEvent::PeerStreamStarted {
                stream: StreamHandle(stream),
            },
        );
        stream
    }

    fn receive(&self, stream: u64, data: &[u8]) {
        self.stream_event(
            stream,
            StreamEvent::Receive {
                data: Bytes::copy_from_slice(data),
            },
        );
    }
}

impl NativeCore for FakeCore {
    fn listener_open(
        &self,
        _addr: SocketAddr,
        _settings: ListenerSettings,
        context: Context,
    ) -> NativeResult<ListenerHandle> {
        let handle = self.allocate();
        self.listeners.lock().insert(handle, context);
        Ok(ListenerHandle(handle))
    }

    fn listener_local_addr(&self, _listener: ListenerHandle) -> NativeResult<SocketAddr> {
        Ok(LOCAL)
    }

    fn listener_close(&self, listener: ListenerHandle) {
        self.listener_event(listener.0, ListenerEvent::StopComplete);
        self.listeners.lock().remove(&listener.0);
        self.closed_listeners.lock().push(listener.0);
    }

    fn connection_open(&self, context: Context) -> ConnectionHandle {
        let handle = self.allocate();
        self.connections.lock().insert(handle, context);
        ConnectionHandle(handle)
    }

    fn connection_start(
        &self,
        connection: ConnectionHandle,
        _addr: SocketAddr,
        _settings: ClientSettings,
    ) -> NativeResult<()> {
        let failure = self.handshake_failure.lock().clone();
        match failure {
            Some(reason) => {
                self.connection_event(connection.0, ConnectionEvent::ShutdownInitiated { reason });
                self.connection_event(connection.0, ConnectionEvent::ShutdownComplete);
            }
            None => self.connection_event(
                connection.0,
                ConnectionEvent::Connected {
                    local: LOCAL,
                    remote: REMOTE,
                },
            ),
        }
        Ok(())
    }

    fn connection_set_context(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<()> {
        match self.connections.lock().get_mut(&connection.0) {
            Some(slot) => {
                *slot = context;
                Ok(())
            }
            None => Err(NativeError::InvalidHandle(connection.0)),
        }
    }

    fn connection_addrs(
        &self,
        _connection: ConnectionHandle,
    ) -> NativeResult<(SocketAddr, SocketAddr)> {
        Ok((LOCAL, REMOTE))
    }

    fn connection_close(&self, connection: ConnectionHandle) {
        let streams: Vec<u64> = self
            .streams
            .lock()
            .iter()
            .filter(|(_, (_, owner))| *owner == connection.0)
            .map(|(handle, _)| *handle)
            .collect();
        self.connection_event(
            connection.0,
            ConnectionEvent::ShutdownInitiated {
                reason: ShutdownReason::Local,
            },
        );
        for stream in streams {
            self.stream_event(
                stream,
                StreamEvent::ShutdownComplete {
                    connection_shutdown: true,
                },
            );
        }
        self.connection_event(connection.0, ConnectionEvent::ShutdownComplete);
        self.connections.lock().remove(&connection.0);
        self.closed_connections.lock().push(connection.0);
    }

    fn stream_open(
        &self,
        connection: ConnectionHandle,
        context: Context,
    ) -> NativeResult<StreamHandle> {
        if !self.connections.lock().contains_key(&connection.0) {
            return Err(NativeError::InvalidHandle(connection.0));
        }
        let handle = self.allocate();
        self.streams.lock().insert(handle, (context, connection.0));
        Ok(StreamHandle(handle))
    }

    fn stream_start(&self, stream: StreamHandle) -> NativeResult<()> {
        self.stream_event(stream.0, StreamEvent::StartComplete { result: Ok(()) });
        Ok(())
    }

    fn stream_set_context(&self, stream: StreamHandle, context: Context) -> NativeResult<()> {
        match self.streams.lock().get_mut(&stream.0) {
            Some(slot) => {
                slot.0 = context;
                Ok(())
            }
            None => Err(NativeError::InvalidHandle(stream.0)),
        }
    }

    fn stream_send(&self, stream: StreamHandle, data: Bytes, send_ctx: u64) -> NativeResult<()> {
        self.sent.lock().push(Sent {
            stream: stream.0,
            send_ctx,
            data,
        });
        if !self.hold_sends.load(Ordering::Acquire) {
            self.stream_event(
                stream.0,
                StreamEvent::SendComplete {
                    send_ctx,
                    canceled: false,
                },
            );
        }
        Ok(())
    }

    fn stream_receive_complete(&self, _stream: StreamHandle, len: u64) {
        self.acks.lock().push(len);
    }

    fn stream_close(&self, stream: StreamHandle) {
        self.closed_streams.lock().push(stream.0);
    }
}

fn client_settings() -> ClientSettings {
    ClientSettings {
        client_config: tls::client_config(&ClientTls::insecure(), &QuicTuning::default())
            .unwrap(),
        server_name: "localhost".to_string(),
        handshake_timeout: Duration::from_millis(200),
    }
}

fn dial(core: &Arc<FakeCore>) -> NativeConnection {
    let dyn_core: Arc<dyn NativeCore> = core.clone();
    NativeConnection::dial(&dyn_core, REMOTE, client_settings(), 4).unwrap()
}

fn open_stream(connection: &NativeConnection) -> NativeStream {
    connection.shared.open_stream().unwrap()
}

fn listen(core: &Arc<FakeCore>) -> NativeListener {
    let dyn_core: Arc<dyn NativeCore> = core.clone();
    let identity = TlsIdentity::self_signed(&["localhost"]).unwrap();
    let settings = ListenerSettings {
        server_config: tls::server_config(&identity, &QuicTuning::default()).unwrap(),
    };
    NativeListener::open(&dyn_core, LOCAL, settings, 4, 4).unwrap()
}

fn read_to_end(stream: &NativeStream, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        match stream.read(&mut buf).unwrap() {
            0 => return out,
            n => out.extend_from_slice(&buf[..n]),
        }
    }
}

#[test]
fn dial_reports_addresses_and_activates() {
    let core = FakeCore::new();
    let connection = dial(&core);
    assert_eq!(connection.phase(), Phase::Active);
    assert_eq!(connection.local_addr(), LOCAL);
    assert_eq!(connection.peer_addr(), REMOTE);
    assert!(!connection.is_closed());
}

#[test]
fn handshake_timeout_maps_to_timeout() {
    let core = FakeCore::new();
    *core.handshake_failure.lock() = Some(ShutdownReason::HandshakeTimeout);
    let dyn_core: Arc<dyn NativeCore> = core.clone();
    let result = NativeConnection::dial(&dyn_core, REMOTE, client_settings(), 4);
    assert!(matches!(result, Err(TransportError::Timeout)));
}

#[test]
fn refused_handshake_maps_to_connect_error() {
    let core = FakeCore::new();
    *core.handshake_failure.lock() = Some(ShutdownReason::Transport("refused".to_string()));
    let dyn_core: Arc<dyn NativeCore> = core.clone();
    let result = NativeConnection::dial(&dyn_core, REMOTE, client_settings(), 4);
    assert!(matches!(result, Err(TransportError::Connect(_))));
}

#[test]
fn short_read_retains_remainder() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);
    let handle = core.stream_handle(stream.shared.context);

    core.receive(handle, b"hello world");

    let mut buf = [0u8; 5];
    assert_eq!(stream.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert!(core.acks.lock().is_empty());

    let mut rest = [0u8; 64];
    let n = stream.read(&mut rest).unwrap();
    assert_eq!(&rest[..n], b" world");
    assert_eq!(*core.acks.lock(), vec![11]);
}

#[test]
fn peer_finish_is_end_of_stream() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);
    let handle = core.stream_handle(stream.shared.context);

    let feeder = {
        let core = Arc::clone(&core);
        thread::spawn(move || {
            core.receive(handle, b"abc");
            core.stream_event(handle, StreamEvent::PeerSendShutdown);
        })
    };
    assert_eq!(read_to_end(&stream, 2), b"abc");
    assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), 0);
    feeder.join().unwrap();
}

#[test]
fn write_reports_full_length_after_completion() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);

    assert_eq!(stream.write(b"ping").unwrap(), 4);
    assert_eq!(stream.write(b"").unwrap(), 0);
    let sent = core.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].data[..], b"ping");
    assert_eq!(sent[0].stream, core.stream_handle(stream.shared.context));
}

#[test]
fn stale_send_completions_are_discarded() {
    let core = FakeCore::new();
    core.hold_sends.store(true, Ordering::Release);
    let connection = dial(&core);
    let stream = Arc::new(open_stream(&connection));
    let handle = core.stream_handle(stream.shared.context);

    let (done_tx, done_rx) = mpsc::channel();
    let writer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || done_tx.send(stream.write(b"data")).unwrap())
    };

    let deadline = Instant::now() + WAIT;
    let send_ctx = loop {
        if let Some(sent) = core.sent.lock().first() {
            break sent.send_ctx;
        }
        assert!(Instant::now() < deadline, "write never reached the core");
        thread::sleep(Duration::from_millis(5));
    };

    core.stream_event(
        handle,
        StreamEvent::SendComplete {
            send_ctx: send_ctx + 100,
            canceled: false,
        },
    );
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    core.stream_event(
        handle,
        StreamEvent::SendComplete {
            send_ctx,
            canceled: false,
        },
    );
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap().unwrap(), 4);
    writer.join().unwrap();
}

#[test]
fn canceled_send_is_a_closed_error() {
    let core = FakeCore::new();
    core.hold_sends.store(true, Ordering::Release);
    let connection = dial(&core);
    let stream = Arc::new(open_stream(&connection));
    let handle = core.stream_handle(stream.shared.context);

    let writer = {
        let stream = Arc::clone(&stream);
        thread::spawn(move || stream.write(b"data"))
    };
    let deadline = Instant::now() + WAIT;
    while core.sent.lock().is_empty() {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(5));
    }
    let send_ctx = core.sent.lock()[0].send_ctx;
    core.stream_event(
        handle,
        StreamEvent::SendComplete {
            send_ctx,
            canceled: true,
        },
    );
    assert!(matches!(
        writer.join().unwrap(),
        Err(TransportError::Closed(Entity::Stream))
    ));
}

#[test]
fn closing_a_connection_unblocks_every_blocked_call() {
    let core = FakeCore::new();
    core.hold_sends.store(true, Ordering::Release);
    let connection = dial(&core);
    let streams: Vec<Arc<NativeStream>> = (0..3)
        .map(|_| Arc::new(open_stream(&connection)))
        .collect();

    let (tx, rx) = mpsc::channel();
    let mut workers = Vec::new();
    for stream in &streams {
        let stream = Arc::clone(stream);
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            let mut buf = [0u8; 16];
            tx.send(format!("read:{:?}", stream.read(&mut buf))).unwrap();
        }));
    }
    {
        let stream = Arc::clone(&streams[0]);
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            let result = stream.write(b"stuck");
            tx.send(format!("write:{}", result.is_err())).unwrap();
        }));
    }

    // Nothing completes until the connection goes away.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    connection.close();

    let mut outcomes: Vec<String> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec!["read:Ok(0)", "read:Ok(0)", "read:Ok(0)", "write:true"]
    );
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(connection.is_closed());
    assert!(matches!(
        connection.open_stream(),
        Err(TransportError::Closed(Entity::Connection))
    ));
}

#[test]
fn double_close_is_a_no_op() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);
    let stream_handle = core.stream_handle(stream.shared.context);
    let connection_handle = core.connection_handle(connection.shared.context);

    stream.close();
    stream.close();
    assert_eq!(stream.phase(), Phase::Closed);
    assert_eq!(*core.closed_streams.lock(), vec![stream_handle]);
    drop(stream);
    assert_eq!(core.closed_streams.lock().len(), 1);

    connection.close();
    connection.close();
    drop(connection);
    assert_eq!(*core.closed_connections.lock(), vec![connection_handle]);
}

#[test]
fn closed_stream_reads_eof_and_rejects_writes() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);
    let handle = core.stream_handle(stream.shared.context);
    stream.close();

    // Unregistered contexts drop events instead of blocking the engine.
    core.receive(handle, b"late");
    core.receive(handle, b"later");

    assert_eq!(stream.read(&mut [0u8; 8]).unwrap(), 0);
    assert!(matches!(
        stream.write(b"x"),
        Err(TransportError::Closed(Entity::Stream))
    ));
    assert!(core.acks.lock().is_empty());
}

#[test]
fn read_deadline_times_out() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let stream = open_stream(&connection);

    stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));
    assert!(matches!(
        stream.read(&mut [0u8; 8]),
        Err(TransportError::Timeout)
    ));
    stream.set_read_deadline(None);
}

#[test]
fn accept_stream_is_fifo() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let handle = core.connection_handle(connection.shared.context);

    let first = core.peer_stream(handle);
    let second = core.peer_stream(handle);

    let a = connection.accept_stream().unwrap();
    let b = connection.accept_stream().unwrap();
    core.receive(first, b"1");
    core.receive(second, b"2");
    let mut buf = [0u8; 1];
    a.read(&mut buf).unwrap();
    assert_eq!(&buf, b"1");
    b.read(&mut buf).unwrap();
    assert_eq!(&buf, b"2");
}

#[test]
fn undelivered_peer_streams_close_with_the_connection() {
    let core = FakeCore::new();
    let connection = dial(&core);
    let handle = core.connection_handle(connection.shared.context);
    let queued = core.peer_stream(handle);

    connection.close();
    assert!(core.closed_streams.lock().contains(&queued));
    assert!(matches!(
        connection.accept_stream(),
        Err(TransportError::Closed(Entity::Connection))
    ));
}

#[test]
fn accept_returns_the_first_peer_stream_as_a_tunnel() {
    let core = FakeCore::new();
    let listener = listen(&core);
    assert_eq!(listener.local_addr(), LOCAL);
    let listener_handle = core.only_listener();

    let connection = core.inbound(listener_handle);
    let stream = core.peer_stream(connection);
    core.receive(stream, b"hi");

    let tunnel = listener.accept().unwrap();
    assert_eq!(tunnel.peer_addr(), REMOTE);
    let mut buf = [0u8; 2];
    tunnel.read(&mut buf).unwrap();
    assert_eq!(&buf, b"hi");
    assert_eq!(tunnel.write(b"ok").unwrap(), 2);

    tunnel.close();
    assert!(core.closed_streams.lock().contains(&stream));
    assert!(core.closed_connections.lock().contains(&connection));
}

#[test]
fn accept_skips_connections_that_die_before_a_stream() {
    let core = FakeCore::new();
    let listener = listen(&core);
    let listener_handle = core.only_listener();

    let dead = core.inbound(listener_handle);
    core.connection_event(
        dead,
        ConnectionEvent::ShutdownInitiated {
            reason: ShutdownReason::IdleTimeout,
        },
    );
    let live = core.inbound(listener_handle);
    core.peer_stream(live);

    let tunnel = listener.accept().unwrap();
    assert!(core.closed_connections.lock().contains(&dead));
    assert!(!core.closed_connections.lock().contains(&live));
    drop(tunnel);
    assert!(core.closed_connections.lock().contains(&live));
}

#[test]
fn closing_a_listener_unblocks_accept() {
    let core = FakeCore::new();
    let listener = Arc::new(listen(&core));

    let (tx, rx) = mpsc::channel();
    let acceptor = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || tx.send(listener.accept().map(|_| ())).unwrap())
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    listener.close();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(TransportError::Closed(Entity::Listener))
    ));
    acceptor.join().unwrap();

    assert_eq!(listener.phase(), Phase::Closed);
    assert!(matches!(
        listener.accept(),
        Err(TransportError::Closed(Entity::Listener))
    ));
    listener.close();
    assert_eq!(core.closed_listeners.lock().len(), 1);
}

#[test]
fn closing_a_listener_closes_queued_connections() {
    let core = FakeCore::new();
    let listener = listen(&core);
    let listener_handle = core.only_listener();
    let queued = core.inbound(listener_handle);

    listener.close();
    assert!(core.closed_connections.lock().contains(&queued));
}

#[test]
fn waiting_for_the_first_stream_races_listener_close() {
    let core = FakeCore::new();
    let listener = Arc::new(listen(&core));
    let listener_handle = core.only_listener();
    let connection = core.inbound(listener_handle);

    let (tx, rx) = mpsc::channel();
    let acceptor = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || tx.send(listener.accept().map(|_| ())).unwrap())
    };
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    listener.close();
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(TransportError::Closed(Entity::Listener))
    ));
    acceptor.join().unwrap();
    assert!(core.closed_connections.lock().contains(&connection));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn acks_match_chunks_for_any_read_size(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8),
        read_size in 1usize..20,
    ) {
        let core = FakeCore::new();
        let connection = dial(&core);
        let stream = open_stream(&connection);
        let handle = core.stream_handle(stream.shared.context);

        let feeder = {
            let core = Arc::clone(&core);
            let chunks = chunks.clone();
            thread::spawn(move || {
                for chunk in &chunks {
                    core.receive(handle, chunk);
                }
                core.stream_event(handle, StreamEvent::PeerSendShutdown);
            })
        };

        let received = read_to_end(&stream, read_size);
        feeder.join().unwrap();

        prop_assert_eq!(received, chunks.concat());
        let lengths: Vec<u64> = chunks.iter().map(|c| c.len() as u64).collect();
        prop_assert_eq!(core.acks.lock().clone(), lengths);
    }
}
