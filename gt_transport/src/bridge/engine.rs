use std::sync::Arc;
use std::time::Duration;

use gt_native::{Api, ClientSettings, ListenerSettings, Settings};
use tracing::info;

use super::connection::NativeConnection;
use super::listener::NativeListener;
use super::native::{Dispatcher, NativeCore};
use crate::config::TransportConfig;
use crate::engine::{Engine, EngineKind, EngineOptions, resolve};
use crate::tls::{self, ClientTls, Congestion, TlsIdentity};
use crate::transport::{Connection, Listener, TransportError, TransportResult};

/// Engine backed by the native callback core.
pub struct NativeEngine {
    core: Arc<dyn NativeCore>,
    options: EngineOptions,
}

impl NativeEngine {
    /// Opens a native engine instance with its own worker threads.
    pub fn new(config: &TransportConfig) -> TransportResult<Self> {
        let settings = Settings {
            worker_threads: config.native.worker_threads,
            stream_receive_window: config.native.stream_receive_window,
            max_chunk_size: config.native.max_chunk_size,
            ..Settings::default()
        };
        let api = Api::open(settings, Arc::new(Dispatcher))
            .map_err(|err| TransportError::Engine(err.to_string()))?;
        info!(
            workers = config.native.worker_threads,
            window = config.native.stream_receive_window,
            "native engine opened"
        );
        Ok(NativeEngine::with_core(
            Arc::new(api),
            EngineOptions::from(config),
        ))
    }

    /// Wraps an already running core.
    pub fn with_core(core: Arc<dyn NativeCore>, options: EngineOptions) -> Self {
        NativeEngine { core, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

impl Engine for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn dial(&self, addr: &str, tls: &ClientTls) -> TransportResult<Arc<dyn Connection>> {
        let (remote, host) = resolve(addr)?;
        let tuning = self
            .options
            .tuning(self.options.idle_timeout, Congestion::Cubic);
        let settings = ClientSettings {
            client_config: tls::client_config(tls, &tuning)?,
            server_name: tls.server_name.clone().unwrap_or(host),
            handshake_timeout: self.options.handshake_timeout,
        };
        let connection =
            NativeConnection::dial(&self.core, remote, settings, self.options.stream_backlog)?;
        Ok(Arc::new(connection))
    }

    fn listen(
        &self,
        addr: &str,
        identity: &TlsIdentity,
        idle_timeout: Duration,
    ) -> TransportResult<Box<dyn Listener>> {
        let (local, _) = resolve(addr)?;
        let tuning = self.options.tuning(idle_timeout, Congestion::Cubic);
        let settings = ListenerSettings {
            server_config: tls::server_config(identity, &tuning)?,
        };
        let listener = NativeListener::open(
            &self.core,
            local,
            settings,
            self.options.connection_backlog,
            self.options.stream_backlog,
        )?;
        Ok(Box::new(listener))
    }
}
