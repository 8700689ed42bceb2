use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::connection::QuicConnection;
use super::listener::QuicListener;
use super::runtime::EngineRuntime;
use crate::config::TransportConfig;
use crate::engine::{Engine, EngineKind, EngineOptions, resolve};
use crate::tls::{self, ClientTls, Congestion, TlsIdentity};
use crate::transport::{Connection, Listener, TransportResult};

/// Software QUIC engine with quinn's default congestion control.
pub struct QuicEngine {
    runtime: Arc<EngineRuntime>,
    options: EngineOptions,
    congestion: Congestion,
}

impl QuicEngine {
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        Self::with_congestion(config, Congestion::Cubic)
    }

    fn with_congestion(config: &TransportConfig, congestion: Congestion) -> TransportResult<Self> {
        let runtime = EngineRuntime::new(config.software.worker_threads, "gt-quic")?;
        info!(
            workers = config.software.worker_threads,
            ?congestion,
            "software engine started"
        );
        Ok(QuicEngine {
            runtime: Arc::new(runtime),
            options: EngineOptions::from(config),
            congestion,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

impl Engine for QuicEngine {
    fn kind(&self) -> EngineKind {
        match self.congestion {
            Congestion::Cubic => EngineKind::Quic,
            Congestion::Bbr => EngineKind::QuicBbr,
        }
    }

    fn dial(&self, addr: &str, tls: &ClientTls) -> TransportResult<Arc<dyn Connection>> {
        let (remote, host) = resolve(addr)?;
        let tuning = self
            .options
            .tuning(self.options.idle_timeout, self.congestion);
        let config = tls::client_config(tls, &tuning)?;
        let server_name = tls.server_name.as_deref().unwrap_or(&host);
        let connection = QuicConnection::dial(
            Arc::clone(&self.runtime),
            remote,
            server_name,
            config,
            self.options.handshake_timeout,
        )?;
        Ok(Arc::new(connection))
    }

    fn listen(
        &self,
        addr: &str,
        identity: &TlsIdentity,
        idle_timeout: Duration,
    ) -> TransportResult<Box<dyn Listener>> {
        let (local, _) = resolve(addr)?;
        let tuning = self.options.tuning(idle_timeout, self.congestion);
        let mut config = tls::server_config(identity, &tuning)?;
        config.max_incoming(self.options.connection_backlog);
        let listener = QuicListener::bind(Arc::clone(&self.runtime), local, config)?;
        Ok(Box::new(listener))
    }
}

/// Software QUIC engine using BBR congestion control.
pub struct BbrEngine(QuicEngine);

impl BbrEngine {
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        QuicEngine::with_congestion(config, Congestion::Bbr).map(BbrEngine)
    }
}

impl Engine for BbrEngine {
    fn kind(&self) -> EngineKind {
        self.0.kind()
    }

    fn dial(&self, addr: &str, tls: &ClientTls) -> TransportResult<Arc<dyn Connection>> {
        self.0.dial(addr, tls)
    }

    fn listen(
        &self,
        addr: &str,
        identity: &TlsIdentity,
        idle_timeout: Duration,
    ) -> TransportResult<Box<dyn Listener>> {
        self.0.listen(addr, identity, idle_timeout)
    }
}
