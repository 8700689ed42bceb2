#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gt_native::{
    Api, ClientSettings, ConnectionEvent, ConnectionHandle, Context, EventHandler, ListenerEvent,
    ListenerHandle, ListenerSettings, Settings, StreamEvent, StreamHandle,
};
use parking_lot::{Condvar, Mutex};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const WAIT: Duration = Duration::from_secs(10);

/// Context attached to connections adopted by the recorder.
pub const ADOPTED_CONNECTION: Context = Context(1_000);
/// Context attached to peer streams adopted by the recorder.
pub const ADOPTED_STREAM: Context = Context(2_000);

#[derive(Debug)]
pub enum Recorded {
    Listener(Context, ListenerHandle, ListenerEvent),
    Connection(Context, ConnectionHandle, ConnectionEvent),
    Stream(Context, StreamHandle, StreamEvent),
}

/// Event handler that keeps the full event history.
pub struct Recorder {
    api: OnceLock<Weak<Api>>,
    history: Mutex<Vec<Recorded>>,
    changed: Condvar,
    pub adopt: bool,
    pub auto_ack: bool,
}

impl Recorder {
    pub fn new(adopt: bool, auto_ack: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            api: OnceLock::new(),
            history: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            adopt,
            auto_ack,
        })
    }

    fn api(&self) -> Option<Arc<Api>> {
        self.api.get().and_then(Weak::upgrade)
    }

    fn push(&self, event: Recorded) {
        self.history.lock().push(event);
        self.changed.notify_all();
    }

    /// Waits until `pick` matches a recorded event and returns its output.
    pub fn wait_for<T>(&self, mut pick: impl FnMut(&Recorded) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        let mut history = self.history.lock();
        loop {
            if let Some(found) = history.iter().find_map(&mut pick) {
                return found;
            }
            if self.changed.wait_until(&mut history, deadline).timed_out() {
                panic!("timed out waiting for event; history: {:#?}", *history);
            }
        }
    }

    /// Index of the first event matching `pick`, if any.
    pub fn position(&self, pick: impl FnMut(&Recorded) -> bool) -> Option<usize> {
        self.history.lock().iter().position(pick)
    }

    pub fn count(&self, pick: impl FnMut(&&Recorded) -> bool) -> usize {
        self.history.lock().iter().filter(pick).count()
    }

    /// Concatenation of every chunk received on `stream`.
    pub fn received(&self, stream: StreamHandle) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.history.lock().iter() {
            if let Recorded::Stream(_, handle, StreamEvent::Receive { data }) = event {
                if *handle == stream {
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    /// Waits until at least `len` bytes were received on `stream`.
    pub fn wait_received(&self, stream: StreamHandle, len: usize) -> Vec<u8> {
        let deadline = Instant::now() + WAIT;
        loop {
            let got = self.received(stream);
            if got.len() >= len {
                return got;
            }
            assert!(
                Instant::now() < deadline,
                "received {} of {len} bytes on {stream}",
                got.len()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl EventHandler for Recorder {
    fn on_listener_event(&self, context: Context, listener: ListenerHandle, event: ListenerEvent) {
        if let ListenerEvent::NewConnection { connection, .. } = &event {
            if self.adopt {
                if let Some(api) = self.api() {
                    api.connection_set_context(*connection, ADOPTED_CONNECTION)
                        .expect("adopt connection");
                }
            }
        }
        self.push(Recorded::Listener(context, listener, event));
    }

    fn on_connection_event(
        &self,
        context: Context,
        connection: ConnectionHandle,
        event: ConnectionEvent,
    ) {
        if let ConnectionEvent::PeerStreamStarted { stream } = &event {
            if let Some(api) = self.api() {
                api.stream_set_context(*stream, ADOPTED_STREAM)
                    .expect("adopt stream");
            }
        }
        self.push(Recorded::Connection(context, connection, event));
    }

    fn on_stream_event(&self, context: Context, stream: StreamHandle, event: StreamEvent) {
        if let StreamEvent::Receive { data } = &event {
            if self.auto_ack {
                if let Some(api) = self.api() {
                    api.stream_receive_complete(stream, data.len() as u64);
                }
            }
        }
        self.push(Recorded::Stream(context, stream, event));
    }
}

pub fn open_engine(settings: Settings, recorder: &Arc<Recorder>) -> Arc<Api> {
    let handler: Arc<dyn EventHandler> = recorder.clone();
    let api = Arc::new(Api::open(settings, handler).expect("open engine"));
    let _ = recorder.api.set(Arc::downgrade(&api));
    api
}

pub fn tls_pair() -> (ListenerSettings, ClientSettings) {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("certificate");
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let server_config =
        quinn::ServerConfig::with_single_cert(vec![cert.clone()], key).expect("server config");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).expect("trust certificate");
    let client_config =
        quinn::ClientConfig::with_root_certificates(Arc::new(roots)).expect("client config");

    (
        ListenerSettings { server_config },
        ClientSettings {
            client_config,
            server_name: "localhost".to_string(),
            handshake_timeout: Duration::from_secs(5),
        },
    )
}

/// A listener and an established client connection on one engine.
pub struct Pair {
    pub listener: ListenerHandle,
    pub addr: SocketAddr,
    pub client: ConnectionHandle,
    pub client_settings: ClientSettings,
}

pub fn connect_pair(api: &Api, recorder: &Recorder) -> Pair {
    let (listener_settings, client_settings) = tls_pair();
    let listener = api
        .listener_open("127.0.0.1:0".parse().unwrap(), listener_settings, Context(1))
        .expect("listener");
    let addr = api.listener_local_addr(listener).expect("listener addr");

    let client = api.connection_open(Context(2));
    api.connection_start(client, addr, client_settings.clone())
        .expect("start connection");
    recorder.wait_for(|e| match e {
        Recorded::Connection(_, h, ConnectionEvent::Connected { .. }) if *h == client => Some(()),
        _ => None,
    });

    Pair {
        listener,
        addr,
        client,
        client_settings,
    }
}

/// Opens and starts a client stream, waiting for its start completion.
pub fn start_stream(api: &Api, recorder: &Recorder, connection: ConnectionHandle, ctx: u64) -> StreamHandle {
    let stream = api
        .stream_open(connection, Context(ctx))
        .expect("open stream");
    api.stream_start(stream).expect("start stream");
    recorder.wait_for(|e| match e {
        Recorded::Stream(_, h, StreamEvent::StartComplete { result }) if *h == stream => {
            assert!(result.is_ok(), "start failed: {result:?}");
            Some(())
        }
        _ => None,
    });
    stream
}

/// The first peer stream handed to the server side.
pub fn wait_peer_stream(recorder: &Recorder) -> (ConnectionHandle, StreamHandle) {
    recorder.wait_for(|e| match e {
        Recorded::Connection(ctx, conn, ConnectionEvent::PeerStreamStarted { stream })
            if *ctx == ADOPTED_CONNECTION =>
        {
            Some((*conn, *stream))
        }
        _ => None,
    })
}

pub fn send(api: &Api, stream: StreamHandle, data: &[u8], send_ctx: u64) {
    api.stream_send(stream, Bytes::copy_from_slice(data), send_ctx)
        .expect("send");
}
