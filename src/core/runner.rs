//! Adapts a [`Job`] to the worker pool: resolves the tracker, drives the
//! per-run status transitions and contains panics.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::JobContext;
use super::error::{AppResult, JobServiceError};
use super::executor::Job;
use super::lifecycle::LifecycleController;
use super::models::PERIODIC_EXECUTION_MARK;
use super::status::Status;
use super::tracker::Tracker;
use crate::infra::work_queue::JobRecord;

/// Fail count that no retry budget reaches.
pub const NO_RETRY_FAILS: i64 = 10_000_000_000;

/// Window after enqueue during which a missing tracker is not counted as a
/// failure; the stats may not be visible yet.
const MISSING_TRACKER_GRACE_SECS: i64 = 2 * 24 * 60 * 60;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Runs job records on behalf of the worker pool.
#[derive(Debug, Clone)]
pub struct JobRunner {
    controller: Arc<LifecycleController>,
    properties: Arc<HashMap<String, String>>,
    cancel: CancellationToken,
    default_max_fails: u32,
}

impl JobRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new(
        controller: Arc<LifecycleController>,
        properties: Arc<HashMap<String, String>>,
        cancel: CancellationToken,
        default_max_fails: u32,
    ) -> Self {
        Self {
            controller,
            properties,
            cancel,
            default_max_fails,
        }
    }

    /// Retry budget of `job`.
    #[must_use]
    pub fn max_fails(&self, job: &dyn Job) -> i64 {
        i64::from(job.max_fails().unwrap_or(self.default_max_fails))
    }

    /// Run `record` with `job`. An `Err` means the attempt failed and the
    /// pool decides on a retry from `record.fails`.
    ///
    /// # Errors
    ///
    /// The job's own error, a recovered panic, or a tracking failure.
    pub async fn run(&self, job: &dyn Job, record: &mut JobRecord) -> AppResult<()> {
        let result = self.run_tracked(job, record).await;
        if !job.should_retry() {
            record.fails = NO_RETRY_FAILS;
        }
        result
    }

    async fn run_tracked(&self, job: &dyn Job, record: &mut JobRecord) -> AppResult<()> {
        let job_id = record.tracking_id();
        let tracker = match self.controller.track(&job_id).await {
            Ok(tracker) => tracker,
            Err(err @ JobServiceError::NotFound(_)) => {
                let age = self.controller.clock().unix() - record.enqueued_at;
                if age < MISSING_TRACKER_GRACE_SECS {
                    // Offsets the increment the pool applies on failure.
                    record.fails -= 1;
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let job_stats = tracker.job();
        match job_stats.status {
            Status::Pending | Status::Scheduled => {}
            Status::Stopped => {
                info!(job_id = %job_id, "Job was stopped before it started, skipping");
                self.finish_periodic(&tracker).await;
                return Ok(());
            }
            Status::Error if record.failed_at > 0 && record.fails < self.max_fails(job) => {
                tracker.reset().await?;
            }
            other => {
                return Err(JobServiceError::Internal(format!(
                    "mismatch status for running job {job_id}: expected Pending, Scheduled or Error with retry budget but got {other}"
                ))
                .into());
            }
        }

        if let Err(e) = tracker.run().await {
            if tracker.cached_status() == Status::Stopped {
                info!(job_id = %job_id, "Job was stopped before it started, skipping");
                self.finish_periodic(&tracker).await;
                return Ok(());
            }
            return Err(e.into());
        }

        let ctx = JobContext::new(
            Arc::clone(&self.properties),
            Arc::clone(&tracker),
            self.cancel.child_token(),
        );
        let mut params = record.args.clone();
        params.remove(PERIODIC_EXECUTION_MARK);

        let outcome = AssertUnwindSafe(job.run(&ctx, &params)).catch_unwind().await;
        let result = outcome.unwrap_or_else(|payload| {
            Err(anyhow!(
                "runtime error: {}; stack: {}",
                panic_message(payload.as_ref()),
                Backtrace::force_capture()
            ))
        });

        match &result {
            Err(e) => {
                error!(job_id = %job_id, job_name = %record.name, error = %e, "Job exited with error");
                if let Err(e) = tracker.fail().await {
                    warn!(job_id = %job_id, error = %e, "Failed to mark job as failed");
                }
            }
            Ok(()) => match tracker.status().await {
                Ok(Status::Stopped) => {
                    info!(job_id = %job_id, "Job was stopped while running");
                }
                _ => {
                    if let Err(e) = tracker.succeed().await {
                        warn!(job_id = %job_id, error = %e, "Failed to mark job as succeeded");
                    }
                }
            },
        }
        self.finish_periodic(&tracker).await;
        result
    }

    async fn finish_periodic(&self, tracker: &Tracker) {
        if !tracker.job().is_periodic_execution() {
            return;
        }
        if let Err(e) = tracker.periodic_execution_done().await {
            warn!(job_id = %tracker.job_id(), error = %e, "Failed to record periodic execution done");
        }
    }
}
