//! Request-level job API: validation and dispatch of job submissions and
//! queries, independent of any HTTP layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{
    JobKind, JobPage, JobQuery, JobServiceError, JobStats, Manager, Parameters, Result,
    WorkerPool, WorkerPoolStats,
};
use crate::period::parse_cron;

/// How a submitted job is run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Job kind; one of `Generic`, `Scheduled`, `Periodic`.
    pub kind: String,
    /// Delay in seconds for scheduled jobs.
    #[serde(default)]
    pub schedule_delay: u64,
    /// Cron spec for periodic jobs.
    #[serde(default)]
    pub cron_spec: String,
    /// Reject duplicates with the same name and parameters.
    #[serde(default)]
    pub unique: bool,
}

/// A job submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Registered job name.
    pub name: String,
    /// Job parameters.
    #[serde(default)]
    pub parameters: Parameters,
    /// Run mode; required.
    pub metadata: Option<JobMetadata>,
    /// Web hook receiving status changes.
    #[serde(default)]
    pub status_hook: String,
}

/// Front door for job submissions and queries.
#[derive(Debug, Clone)]
pub struct JobController {
    pool: Arc<WorkerPool>,
    manager: Arc<Manager>,
}

impl JobController {
    /// Create a controller over `pool` and `manager`.
    #[must_use]
    pub const fn new(pool: Arc<WorkerPool>, manager: Arc<Manager>) -> Self {
        Self { pool, manager }
    }

    fn validate(&self, req: &JobRequest) -> Result<(JobKind, JobMetadata)> {
        if req.name.trim().is_empty() {
            return Err(JobServiceError::bad_request("empty job name"));
        }
        let meta = req
            .metadata
            .clone()
            .ok_or_else(|| JobServiceError::bad_request("missing job metadata"))?;
        let kind: JobKind = meta.kind.parse()?;
        match kind {
            JobKind::Scheduled if meta.schedule_delay == 0 => {
                return Err(JobServiceError::bad_request(
                    "schedule delay must be greater than 0 for scheduled jobs",
                ));
            }
            JobKind::Periodic => {
                parse_cron(&meta.cron_spec)?;
            }
            _ => {}
        }
        if !self.pool.is_known_job(&req.name) {
            return Err(JobServiceError::bad_request(format!("unknown job `{}`", req.name)));
        }
        self.pool.validate_job_parameters(&req.name, &req.parameters)?;
        Ok((kind, meta))
    }

    /// Validate and launch a job.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid requests, `Conflict` for duplicate unique
    /// jobs, store failures otherwise.
    pub async fn launch_job(&self, req: JobRequest) -> Result<JobStats> {
        let (kind, meta) = self.validate(&req)?;
        let JobRequest {
            name,
            parameters,
            status_hook,
            ..
        } = req;
        let stats = match kind {
            JobKind::Generic => {
                self.pool
                    .enqueue(&name, parameters, meta.unique, &status_hook)
                    .await?
            }
            JobKind::Scheduled => {
                self.pool
                    .schedule(&name, parameters, meta.schedule_delay, meta.unique, &status_hook)
                    .await?
            }
            JobKind::Periodic => {
                self.pool
                    .periodically_enqueue(&name, parameters, &meta.cron_spec, &status_hook)
                    .await?
            }
        };
        info!(job_id = %stats.job_id, job_name = %stats.job_name, kind = %stats.job_kind, "Job launched");
        Ok(stats)
    }

    /// Stats of one job.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an empty ID, `NotFound` for unknown jobs.
    pub async fn get_job(&self, job_id: &str) -> Result<JobStats> {
        self.manager.get_job(job_id).await
    }

    /// Stop a job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs; store failures otherwise.
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        if job_id.trim().is_empty() {
            return Err(JobServiceError::bad_request("empty job ID"));
        }
        debug!(job_id, "Stop requested");
        self.pool.stop_job(job_id).await
    }

    /// Retry a job that failed permanently.
    ///
    /// # Errors
    ///
    /// `BadRequest` when the job is not in Error; `NotFound` when unknown.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        if job_id.trim().is_empty() {
            return Err(JobServiceError::bad_request("empty job ID"));
        }
        self.pool.retry_job(job_id).await
    }

    /// Health of every worker pool sharing the namespace.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn check_status(&self) -> Result<Vec<WorkerPoolStats>> {
        self.pool.stats().await
    }

    /// Executions of a periodic job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs, `BadRequest` when the job is not periodic.
    pub async fn get_periodic_executions(&self, job_id: &str, query: JobQuery) -> Result<JobPage> {
        let stats = self.manager.get_job(job_id).await?;
        if stats.job_kind != JobKind::Periodic {
            return Err(JobServiceError::bad_request(format!(
                "job {job_id} is not a periodic job"
            )));
        }
        self.manager.get_periodic_executions(job_id, query).await
    }

    /// Jobs waiting in the delayed queue.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn get_scheduled_jobs(&self, query: JobQuery) -> Result<JobPage> {
        self.manager.get_scheduled_jobs(query).await
    }

    /// All tracked jobs, newest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn get_jobs(&self, query: JobQuery) -> Result<JobPage> {
        self.manager.get_jobs(query).await
    }
}
