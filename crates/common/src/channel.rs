//! Async channel bridge between Tokio runtime and driver worker threads

use crate::{Result, ScanError};
use async_channel::{Receiver, Sender, bounded};
use std::fmt;

/// Unit of work executed on a worker thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Commands from Tokio runtime to a worker thread
pub enum WorkerCommand {
    /// Run a job on the worker's dedicated context
    Run(Job),

    /// Shutdown the worker thread gracefully
    Shutdown,
}

impl fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::Run(_) => f.write_str("Run(..)"),
            WorkerCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct WorkerBridge {
    cmd_tx: Sender<WorkerCommand>,
}

impl WorkerBridge {
    /// Send a command to the worker thread
    pub async fn send_command(&self, cmd: WorkerCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| ScanError::Channel(e.to_string()))
    }

    /// Run a closure on the worker thread and await its return value
    ///
    /// The closure's value is handed back untouched, so an `Err` produced on
    /// the worker reaches the caller with its original identity.
    pub async fn run<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(WorkerCommand::Run(Box::new(move || {
            let _ = tx.send(job());
        })))
        .await?;

        // The sender is only dropped without a reply when the job unwinds
        rx.await
            .map_err(|_| ScanError::WorkerPanicked("job did not complete".to_string()))
    }

    /// Whether the worker side has gone away
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Handle for the worker thread (blocking)
pub struct WorkerEndpoint {
    cmd_rx: Receiver<WorkerCommand>,
}

impl WorkerEndpoint {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> Result<WorkerCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| ScanError::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and a worker thread
///
/// Returns (WorkerBridge for Tokio, WorkerEndpoint for the worker thread)
pub fn create_worker_bridge() -> (WorkerBridge, WorkerEndpoint) {
    let (cmd_tx, cmd_rx) = bounded(256);

    (WorkerBridge { cmd_tx }, WorkerEndpoint { cmd_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, endpoint) = create_worker_bridge();

        let handle = std::thread::spawn(move || {
            let cmd = endpoint.recv_command().unwrap();
            matches!(cmd, WorkerCommand::Shutdown)
        });

        bridge.send_command(WorkerCommand::Shutdown).await.unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let (bridge, endpoint) = create_worker_bridge();

        let handle = std::thread::spawn(move || {
            if let Ok(WorkerCommand::Run(job)) = endpoint.recv_command() {
                job();
            }
        });

        let value = bridge.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_run_after_worker_gone() {
        let (bridge, endpoint) = create_worker_bridge();
        drop(endpoint);

        assert!(bridge.is_closed());
        let err = bridge.run(|| ()).await.unwrap_err();
        assert!(matches!(err, ScanError::Channel(_)));
    }
}
