//! Bridge from synchronous call sites into the client's event loop.
//!
//! Everything inside this crate is async and runs on one single-threaded
//! tokio runtime.  Callers that are not async themselves (a plain `main`, a
//! test harness, a foreign-function boundary) go through a
//! [`BlockingPortal`]: it owns a worker thread running that runtime, and
//! [`BlockingPortal::call`] submits a future to it and blocks the calling
//! thread until the result comes back.
//!
//! The portal is only meant for the outermost API layer.  Internal code
//! awaits futures directly.

use std::future::Future;
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Error type for portal operations.
#[derive(Debug, Error)]
pub enum PortalError {
    /// The worker thread or its runtime could not be created.
    #[error("failed to start portal worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// The worker thread exited before handing over its runtime.
    #[error("portal worker exited during start-up")]
    WorkerGone,

    /// The submitted task panicked or was cancelled before replying.
    #[error("portal task did not complete")]
    TaskFailed,

    /// `call` was made from inside an async context, where blocking would
    /// stall the executor.
    #[error("blocking portal called from within an async runtime")]
    InsideRuntime,
}

/// Owns the event-loop thread and accepts work from synchronous callers.
///
/// Dropping the portal stops the runtime and joins its thread; tasks still
/// running on it are cancelled.
pub struct BlockingPortal {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl BlockingPortal {
    /// Starts the worker thread and its single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PortalError::Spawn`] if the thread or runtime cannot be
    /// created.
    pub fn start() -> Result<Self, PortalError> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let worker = std::thread::Builder::new()
            .name("jmp-portal".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                if handle_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("portal runtime stopped");
            })?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(PortalError::Spawn(e));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(PortalError::WorkerGone);
            }
        };

        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    /// Handle to the portal's runtime, for spawning background loops.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `future` on the portal's runtime and blocks until it completes.
    ///
    /// # Errors
    ///
    /// - [`PortalError::InsideRuntime`] when called from async code.
    /// - [`PortalError::TaskFailed`] if the task panics or the runtime stops
    ///   first.
    pub fn call<F, T>(&self, future: F) -> Result<T, PortalError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(PortalError::InsideRuntime);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = reply_tx.send(future.await);
        });
        reply_rx.blocking_recv().map_err(|_| PortalError::TaskFailed)
    }
}

impl Drop for BlockingPortal {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("portal worker thread panicked");
            }
        }
    }
}
