use std::future::Future;
use std::time::Instant;

use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::transport::{TransportError, TransportResult};

/// Runtime owned by one software engine and shared by everything it creates.
pub(crate) struct EngineRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl EngineRuntime {
    pub(crate) fn new(worker_threads: usize, thread_name: &str) -> TransportResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|err| TransportError::Engine(format!("failed to start runtime: {err}")))?;
        let handle = runtime.handle().clone();
        Ok(EngineRuntime {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Runs `future` to completion on the calling thread. Must not be called
    /// from inside an async context.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Enters the runtime so endpoints can bind their sockets.
    pub(crate) fn enter(&self) -> EnterGuard<'_> {
        self.handle.enter()
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Awaits `future`, giving up at `deadline`.
pub(crate) async fn until<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(tokio::time::Instant::from_std(at), future)
            .await
            .ok(),
        None => Some(future.await),
    }
}
