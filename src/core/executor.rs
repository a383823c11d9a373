//! Job implementation trait.

use async_trait::async_trait;

use super::context::JobContext;
use super::error::{AppResult, Result};
use super::models::Parameters;

/// A unit of work registered with the worker pool under a job name.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_jobservice::core::{AppResult, Job, JobContext, Parameters};
///
/// struct ScanImage;
///
/// #[async_trait]
/// impl Job for ScanImage {
///     async fn run(&self, ctx: &JobContext, params: &Parameters) -> AppResult<()> {
///         ctx.check_in("scanning").await?;
///         let repo = params.get("repo").and_then(|v| v.as_str()).unwrap_or_default();
///         tracing::info!(repo, "scanned");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Failed attempts before the job is given up; `None` uses the pool
    /// default.
    fn max_fails(&self) -> Option<u32> {
        None
    }

    /// Whether a failed run may be retried at all.
    fn should_retry(&self) -> bool {
        true
    }

    /// Check submitted parameters before the job is accepted.
    ///
    /// # Errors
    ///
    /// `BadRequest` describing the invalid parameter.
    fn validate(&self, _params: &Parameters) -> Result<()> {
        Ok(())
    }

    /// Execute the job.
    ///
    /// # Threading
    ///
    /// Called from a dedicated worker thread with its own single-threaded
    /// tokio runtime, so CPU-bound work does not block the main runtime.
    async fn run(&self, ctx: &JobContext, params: &Parameters) -> AppResult<()>;
}
