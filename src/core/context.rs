//! Execution context handed to running jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::Result;
use super::status::Status;
use super::tracker::Tracker;

/// Operation requested from outside a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCommand {
    /// The job was asked to stop.
    Stop,
}

/// Per-run context: ambient properties, the job's tracker and the system
/// cancellation token.
#[derive(Debug, Clone)]
pub struct JobContext {
    properties: Arc<HashMap<String, String>>,
    tracker: Arc<Tracker>,
    cancel: CancellationToken,
}

impl JobContext {
    /// Build a context.
    #[must_use]
    pub const fn new(
        properties: Arc<HashMap<String, String>>,
        tracker: Arc<Tracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            properties,
            tracker,
            cancel,
        }
    }

    /// ID of the running job.
    #[must_use]
    pub fn job_id(&self) -> &str {
        self.tracker.job_id()
    }

    /// Ambient property, if configured.
    #[must_use]
    pub fn get(&self, prop: &str) -> Option<&str> {
        self.properties.get(prop).map(String::as_str)
    }

    /// Report progress.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an empty message; store failures otherwise.
    pub async fn check_in(&self, message: &str) -> Result<()> {
        self.tracker.check_in(message).await
    }

    /// Pending operation for the job, read from its latest tracked status.
    pub async fn op_command(&self) -> Option<OpCommand> {
        match self.tracker.status().await {
            Ok(Status::Stopped) => Some(OpCommand::Stop),
            Ok(_) => None,
            Err(e) => {
                warn!(job_id = %self.job_id(), error = %e, "Failed to read latest job status");
                None
            }
        }
    }

    /// Tracker of the running job.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// True once the service is shutting down.
    #[must_use]
    pub fn system_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the service shuts down.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}
