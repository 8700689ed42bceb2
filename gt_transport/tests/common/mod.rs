#![allow(dead_code)]

use std::time::Duration;

use tracing::Level;

use gt_transport::logging::{LogOptions, init_logging};
use gt_transport::{
    ClientTls, Engine, EngineKind, Listener, TlsIdentity, TransportConfig, Tunnel, open_engine,
};

pub const ALL_ENGINES: [EngineKind; 3] = [EngineKind::Native, EngineKind::Quic, EngineKind::QuicBbr];
pub const WAIT: Duration = Duration::from_secs(10);
pub const IDLE: Duration = Duration::from_secs(10);

/// Installs the crate's stdout subscriber once per test binary.
pub fn init_tracing() {
    let options = LogOptions {
        level: Level::DEBUG,
        include_file_line: false,
        ..Default::default()
    };
    // Stdout only, so there is no file writer guard to keep.
    let _ = init_logging(options);
}

pub fn engine(kind: EngineKind) -> Box<dyn Engine> {
    init_tracing();
    let mut config = TransportConfig::with_engine(kind);
    config.handshake_timeout_ms = 5_000;
    open_engine(&config).unwrap()
}

pub fn identity() -> TlsIdentity {
    TlsIdentity::self_signed(&["localhost"]).unwrap()
}

pub fn trust(identity: &TlsIdentity) -> ClientTls {
    ClientTls::trusting(identity.certificate().unwrap().clone()).with_server_name("localhost")
}

/// A loopback listener on an ephemeral port.
pub fn listen(engine: &dyn Engine, identity: &TlsIdentity) -> Box<dyn Listener> {
    engine.listen("127.0.0.1:0", identity, IDLE).unwrap()
}

/// Echoes everything read on `tunnel` until end of stream, then reports
/// how many bytes went through.
pub fn echo(tunnel: Tunnel) -> usize {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = match tunnel.read(&mut buf) {
            Ok(0) | Err(_) => return total,
            Ok(n) => n,
        };
        if tunnel.write(&buf[..n]).is_err() {
            return total;
        }
        total += n;
    }
}
