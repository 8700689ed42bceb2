//! Engine selection and the engine-neutral tunnel.
//!
//! Three engines satisfy the same [`Engine`] contract: the native callback
//! engine, the software `quinn` engine and its BBR variant. Upper layers pick
//! one at construction time with [`open_engine`] and never branch on engine
//! identity afterwards.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bridge::NativeEngine;
use crate::config::TransportConfig;
use crate::quic::{BbrEngine, QuicEngine};
use crate::tls::{ClientTls, Congestion, QuicTuning, TlsIdentity};
use crate::transport::{Connection, Listener, Stream, TransportError, TransportResult};

/// Which engine carries the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Callback-driven native engine behind the bridge
    #[default]
    Native,
    /// Software QUIC with default congestion control
    Quic,
    /// Software QUIC with BBR
    QuicBbr,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Native => write!(f, "native"),
            EngineKind::Quic => write!(f, "quic"),
            EngineKind::QuicBbr => write!(f, "quic-bbr"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(EngineKind::Native),
            "quic" => Ok(EngineKind::Quic),
            "quic-bbr" | "bbr" => Ok(EngineKind::QuicBbr),
            other => Err(TransportError::Configuration(format!(
                "unknown engine '{other}'"
            ))),
        }
    }
}

/// Options every engine applies to the connections it creates.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub alpn: String,
    pub idle_timeout: Duration,
    pub keep_alive: Option<Duration>,
    pub handshake_timeout: Duration,
    /// Inbound connections queued before accept
    pub connection_backlog: usize,
    /// Peer streams queued per connection before accept_stream
    pub stream_backlog: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for EngineOptions {
    fn from(config: &TransportConfig) -> Self {
        EngineOptions {
            alpn: config.alpn.clone(),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            keep_alive: (config.keep_alive_ms > 0)
                .then(|| Duration::from_millis(config.keep_alive_ms)),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            connection_backlog: config.connection_backlog.max(1),
            stream_backlog: config.stream_backlog.max(1),
        }
    }
}

impl EngineOptions {
    /// Transport tuning for these options with `idle_timeout` applied.
    pub fn tuning(&self, idle_timeout: Duration, congestion: Congestion) -> QuicTuning {
        QuicTuning {
            alpn: self.alpn.as_bytes().to_vec(),
            idle_timeout,
            keep_alive: self.keep_alive,
            congestion,
        }
    }
}

/// A QUIC engine able to dial and listen.
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Dials `addr` (`host:port`) and completes the handshake.
    fn dial(&self, addr: &str, tls: &ClientTls) -> TransportResult<Arc<dyn Connection>>;

    /// Binds `addr` and presents `identity` to clients.
    fn listen(
        &self,
        addr: &str,
        identity: &TlsIdentity,
        idle_timeout: Duration,
    ) -> TransportResult<Box<dyn Listener>>;

    /// Dials `addr` and opens the tunnel's control stream.
    fn connect(&self, addr: &str, tls: &ClientTls) -> TransportResult<Tunnel> {
        let connection = self.dial(addr, tls)?;
        match connection.open_stream() {
            Ok(stream) => {
                debug!(engine = %self.kind(), %addr, "tunnel stream opened");
                Ok(Tunnel::new(stream, connection))
            }
            Err(err) => {
                connection.close();
                Err(err)
            }
        }
    }
}

/// Builds the engine named by `config.engine`.
pub fn open_engine(config: &TransportConfig) -> TransportResult<Box<dyn Engine>> {
    config
        .validate()
        .map_err(|err| TransportError::Configuration(err.to_string()))?;
    let engine: Box<dyn Engine> = match config.engine {
        EngineKind::Native => Box::new(NativeEngine::new(config)?),
        EngineKind::Quic => Box::new(QuicEngine::new(config)?),
        EngineKind::QuicBbr => Box::new(BbrEngine::new(config)?),
    };
    info!(engine = %config.engine, alpn = %config.alpn, "transport engine ready");
    Ok(engine)
}

/// Resolves `host:port` to its first address, returning the host part too.
pub(crate) fn resolve(addr: &str) -> TransportResult<(SocketAddr, String)> {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => return Err(TransportError::Resolve(format!("{addr}: missing port"))),
    };
    let resolved = addr
        .to_socket_addrs()
        .map_err(|err| TransportError::Resolve(format!("{addr}: {err}")))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{addr}: no addresses")))?;
    Ok((resolved, host.to_string()))
}

/// A connection together with one of its streams, used as a single
/// bidirectional channel.
pub struct Tunnel {
    stream: Box<dyn Stream>,
    connection: Arc<dyn Connection>,
}

impl Tunnel {
    pub fn new(stream: Box<dyn Stream>, connection: Arc<dyn Connection>) -> Self {
        Tunnel { stream, connection }
    }

    pub fn stream(&self) -> &dyn Stream {
        self.stream.as_ref()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn into_parts(self) -> (Box<dyn Stream>, Arc<dyn Connection>) {
        (self.stream, self.connection)
    }

    pub fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        self.stream.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        self.stream.write(buf)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.stream.set_deadline(deadline);
    }

    /// Closes the stream, then the connection.
    pub fn close(&self) {
        self.stream.close();
        self.connection.close();
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .finish()
    }
}

impl io::Read for Tunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.stream.read(buf)?)
    }
}

impl io::Write for Tunnel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.stream.write(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
