//! Shared shutdown context of the background loops.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Cancellation token plus the set of tasks that must drain on shutdown.
#[derive(Debug, Clone, Default)]
pub struct SystemContext {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SystemContext {
    /// Fresh context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once shutdown started.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn a tracked task on the current tokio runtime.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(fut)
    }

    /// Number of tracked tasks still running.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every loop and wait up to `timeout` for the tracked tasks.
    /// Returns false when the timeout elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            info!("All background loops stopped");
            true
        } else {
            warn!(remaining = self.tasks.len(), "Background loops did not stop in time");
            false
        }
    }

    /// Cancel the context on SIGINT or SIGTERM.
    pub fn install_signal_handler(&self) {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install unix signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received ctrl-c, initiating graceful shutdown");
    }
}
