//! Driver worker thread
//!
//! A dedicated OS thread that owns one execution-context identity for its
//! whole life. Every driver call routed through it runs with that identity
//! installed, and the thread tears the driver's bindings down before it
//! exits.
//!
//! The Tokio side talks to the thread through a [`WorkerBridge`]; each job
//! carries its own oneshot reply so results and errors come back to the
//! awaiting caller unchanged.

use common::{Result, ScanError, WorkerBridge, WorkerCommand, WorkerEndpoint, create_worker_bridge};
use driver::{ContextGuard, ContextId, ScanDriver};
use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Handle to a running driver worker thread
pub struct DriverWorker {
    name: String,
    context: ContextId,
    bridge: WorkerBridge,
    handle: Option<JoinHandle<()>>,
}

impl DriverWorker {
    /// Spawn a worker thread and wait until its context is initialised
    ///
    /// A fault raised while the driver binds to the new context is returned
    /// here and the thread exits.
    pub async fn start(name: impl Into<String>, driver: Arc<dyn ScanDriver>) -> Result<Self> {
        let name = name.into();
        let (bridge, endpoint) = create_worker_bridge();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_main(driver, endpoint, ready_tx))?;

        let context = match ready_rx.await {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                return Err(e);
            }
            Err(_) => {
                return Err(ScanError::WorkerPanicked(format!(
                    "{} exited during start-up",
                    name
                )));
            }
        };

        debug!("Worker {} ready in {}", name, context);
        Ok(Self {
            name,
            context,
            bridge,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context identity owned by this worker
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_closed(&self) -> bool {
        self.bridge.is_closed()
    }

    /// Run a closure on the worker thread and await its result
    pub async fn run<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.bridge.run(job).await
    }

    /// Stop the thread after queued jobs and wait for it to exit
    pub async fn shutdown(mut self) -> Result<()> {
        // A closed bridge means the thread is already on its way out
        if let Err(e) = self.bridge.send_command(WorkerCommand::Shutdown).await {
            debug!("Worker {} already stopped: {}", self.name, e);
        }
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let name = self.name.clone();
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {
                debug!("Worker {} joined", name);
                Ok(())
            }
            Ok(Err(payload)) => Err(ScanError::WorkerPanicked(panic_message(&*payload))),
            Err(e) => Err(ScanError::WorkerPanicked(e.to_string())),
        }
    }
}

impl Drop for DriverWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Not joined: ask the thread to finish on its own
            let bridge = self.bridge.clone();
            let name = self.name.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if bridge.send_command(WorkerCommand::Shutdown).await.is_err() {
                        debug!("Worker {} already stopped", name);
                    }
                });
            } else {
                warn!("Worker {} dropped outside a runtime without shutdown", self.name);
            }
        }
    }
}

impl std::fmt::Debug for DriverWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverWorker")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn worker_main(
    driver: Arc<dyn ScanDriver>,
    endpoint: WorkerEndpoint,
    ready: oneshot::Sender<Result<ContextId>>,
) {
    let guard = ContextGuard::enter();
    let context = guard.id();

    if let Err(fault) = driver.enter_context(context) {
        error!("Failed to initialise {}: {}", context, fault);
        let _ = ready.send(Err(fault.into()));
        return;
    }
    let _ = ready.send(Ok(context));
    info!("Driver worker started in {}", context);

    loop {
        match endpoint.recv_command() {
            Ok(WorkerCommand::Run(job)) => {
                // Keep the thread (and its context) alive if a job panics
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                    error!("Panic in driver job: {}", panic_message(&*payload));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                debug!("Driver worker in {} shutting down", context);
                break;
            }
            Err(_) => {
                debug!("All bridges to {} dropped", context);
                break;
            }
        }
    }

    driver.release_handles(context);
    driver.leave_context(context);
    drop(guard);
    info!("Driver worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
