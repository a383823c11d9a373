//! Durable per-job state machine.
//!
//! A [`Tracker`] mediates every read and write of one job's stats hash. Status
//! writes are compare-and-set on the stored status, so a straggling writer can
//! never move a job backwards; such updates land in the status retry queue and
//! are reconciled by the restorer in [`super::lifecycle`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, error, warn};

use super::error::{JobServiceError, Result};
use super::models::{JobKind, JobStats, SimpleStatusChange, StatusChange};
use super::status::Status;
use crate::infra::keys::Keys;
use crate::infra::store::{SharedStore, StoreOp};
use crate::util::SharedClock;

/// Base time to live of non-periodic job stats.
pub const STATS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Status writes attempted before a concurrent-update failure is reported.
const CAS_ATTEMPTS: usize = 3;

/// Receiver of status changes for jobs that carry a web hook URL.
#[async_trait]
pub trait HookCallback: Send + Sync + 'static {
    /// Called after a status change or check-in was recorded.
    async fn on_status_change(&self, hook_url: &str, change: StatusChange) -> Result<()>;
}

/// Collaborators shared by every tracker of a node.
#[derive(Clone)]
pub struct TrackerEnv {
    pub(crate) store: SharedStore,
    pub(crate) keys: Keys,
    pub(crate) clock: SharedClock,
    pub(crate) callback: Option<Arc<dyn HookCallback>>,
}

impl TrackerEnv {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        store: SharedStore,
        keys: Keys,
        clock: SharedClock,
        callback: Option<Arc<dyn HookCallback>>,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            callback,
        }
    }
}

/// Handle on the tracked state of one job.
pub struct Tracker {
    job_id: String,
    env: TrackerEnv,
    stats: RwLock<JobStats>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("job_id", &self.job_id)
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Tracker over fresh stats (not yet saved).
    pub(crate) fn with_stats(stats: JobStats, env: TrackerEnv) -> Self {
        Self {
            job_id: stats.job_id.clone(),
            env,
            stats: RwLock::new(stats),
        }
    }

    /// Tracker over an existing job (not yet loaded).
    pub(crate) fn with_id(job_id: &str, env: TrackerEnv) -> Self {
        Self {
            job_id: job_id.to_string(),
            env,
            stats: RwLock::new(JobStats {
                job_id: job_id.to_string(),
                ..JobStats::default()
            }),
        }
    }

    /// ID of the tracked job.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Snapshot of the cached stats.
    #[must_use]
    pub fn job(&self) -> JobStats {
        self.stats.read().clone()
    }

    /// Cached status (as of the last load or write).
    #[must_use]
    pub fn cached_status(&self) -> Status {
        self.stats.read().status
    }

    fn key(&self) -> String {
        self.env.keys.job_stats(&self.job_id)
    }

    fn ttl_for(&self, stats: &JobStats) -> Duration {
        let mut ttl = STATS_TTL;
        if stats.job_kind == JobKind::Scheduled {
            let delay = stats.run_at - self.env.clock.unix();
            if delay > 0 {
                ttl += Duration::from_secs(delay.unsigned_abs());
            }
        }
        ttl + Duration::from_secs(rand::rng().random_range(0..=30))
    }

    /// Persist the cached stats and index them.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid stats; store failures otherwise.
    pub async fn save(&self) -> Result<()> {
        let stats = {
            let mut stats = self.stats.write();
            if stats.update_time == 0 {
                stats.update_time = self.env.clock.unix();
            }
            stats.clone()
        };
        stats.validate()?;

        let key = self.key();
        let mut ops = vec![
            StoreOp::HSet {
                key: key.clone(),
                fields: stats.to_fields()?,
            },
            StoreOp::ZAdd {
                key: self.env.keys.job_index(),
                score: stats.enqueue_time,
                member: stats.job_id.clone(),
            },
        ];
        if stats.is_periodic_execution() {
            // A finished execution is re-scored -1 and must stay that way.
            ops.push(StoreOp::ZAddNx {
                key: self.env.keys.executions(&stats.upstream_job_id),
                score: stats.run_at,
                member: stats.job_id.clone(),
            });
        }
        if stats.job_kind != JobKind::Periodic {
            ops.push(StoreOp::Expire {
                key,
                ttl: self.ttl_for(&stats),
            });
        }
        self.env.store.atomic(ops).await?;
        debug!(job_id = %self.job_id, status = %stats.status, "Job stats saved");
        Ok(())
    }

    /// Reload the cached stats from the store.
    ///
    /// # Errors
    ///
    /// `NotFound` when the job is unknown or its stats expired.
    pub async fn load(&self) -> Result<()> {
        let fields = self.env.store.hgetall(&self.key()).await?;
        let stats = JobStats::from_fields(&fields).map_err(|e| match e {
            JobServiceError::NotFound(_) => JobServiceError::NotFound(format!("job {}", self.job_id)),
            other => other,
        })?;
        *self.stats.write() = stats;
        Ok(())
    }

    /// Latest stored status; refreshes the cached value.
    ///
    /// # Errors
    ///
    /// `NotFound` when the stats are gone.
    pub async fn status(&self) -> Result<Status> {
        let raw = self
            .env
            .store
            .hget(&self.key(), "status")
            .await?
            .ok_or_else(|| JobServiceError::NotFound(format!("job {}", self.job_id)))?;
        let status: Status = raw
            .parse()
            .map_err(|_| JobServiceError::Internal(format!("job {} has invalid status {raw}", self.job_id)))?;
        self.stats.write().status = status;
        Ok(status)
    }

    /// Mark the job Running.
    ///
    /// # Errors
    ///
    /// See [`Tracker::update_status_with_retry`].
    pub async fn run(&self) -> Result<()> {
        self.update_status_with_retry(Status::Running).await
    }

    /// Mark the job Error.
    ///
    /// # Errors
    ///
    /// See [`Tracker::update_status_with_retry`].
    pub async fn fail(&self) -> Result<()> {
        self.update_status_with_retry(Status::Error).await
    }

    /// Mark the job Success.
    ///
    /// # Errors
    ///
    /// See [`Tracker::update_status_with_retry`].
    pub async fn succeed(&self) -> Result<()> {
        self.update_status_with_retry(Status::Success).await
    }

    /// Mark the job Stopped.
    ///
    /// # Errors
    ///
    /// See [`Tracker::update_status_with_retry`].
    pub async fn stop(&self) -> Result<()> {
        self.update_status_with_retry(Status::Stopped).await
    }

    /// Record a progress message and notify the hook.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an empty message; store failures otherwise.
    pub async fn check_in(&self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(JobServiceError::bad_request(format!(
                "empty check in message for job {}",
                self.job_id
            )));
        }
        let now = self.env.clock.unix();
        self.env
            .store
            .hset(
                &self.key(),
                &[
                    ("check_in".into(), message.to_string()),
                    ("check_in_at".into(), now.to_string()),
                    ("update_time".into(), now.to_string()),
                ],
            )
            .await?;
        let snapshot = {
            let mut stats = self.stats.write();
            stats.check_in = message.to_string();
            stats.check_in_at = now;
            stats.update_time = now;
            stats.clone()
        };
        self.fire_hook(StatusChange {
            job_id: self.job_id.clone(),
            status: snapshot.status,
            check_in: Some(message.to_string()),
            metadata: Some(snapshot),
        })
        .await;
        Ok(())
    }

    /// Prepare an errored job for another attempt: status back to Pending,
    /// revision bumped and run-scoped fields cleared.
    ///
    /// # Errors
    ///
    /// `StatusMismatch` when the job is no longer in Error.
    pub async fn reset(&self) -> Result<()> {
        self.load().await?;
        let (current, revision) = {
            let stats = self.stats.read();
            (stats.status, stats.revision + 1)
        };
        let now = self.env.clock.unix();
        let applied = self
            .env
            .store
            .hset_if(
                &self.key(),
                "status",
                Status::Error.as_str(),
                &[
                    ("status".into(), Status::Pending.to_string()),
                    ("revision".into(), revision.to_string()),
                    ("check_in".into(), String::new()),
                    ("check_in_at".into(), "0".into()),
                    ("die_at".into(), "0".into()),
                    ("update_time".into(), now.to_string()),
                ],
            )
            .await?;
        if !applied {
            return Err(JobServiceError::StatusMismatch {
                current,
                target: Status::Pending,
            });
        }
        let mut stats = self.stats.write();
        stats.status = Status::Pending;
        stats.revision = revision;
        stats.check_in.clear();
        stats.check_in_at = 0;
        stats.die_at = 0;
        stats.update_time = now;
        Ok(())
    }

    /// Let the stats expire like those of a finished non-periodic job.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn expire(&self) -> Result<()> {
        let ttl = STATS_TTL;
        if !self.env.store.expire(&self.key(), ttl).await? {
            warn!(job_id = %self.job_id, "Stats to expire were already gone");
        }
        Ok(())
    }

    /// Numeric ID of a periodic policy (its creation epoch).
    ///
    /// # Errors
    ///
    /// `Internal` when the job carries no numeric ID.
    pub fn numeric_id(&self) -> Result<i64> {
        let id = self.stats.read().numeric_policy_id;
        if id > 0 {
            Ok(id)
        } else {
            Err(JobServiceError::Internal(format!(
                "numeric ID not found for job {}",
                self.job_id
            )))
        }
    }

    /// Mark a periodic execution as done so that non-dead execution queries
    /// skip it.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn periodic_execution_done(&self) -> Result<()> {
        let upstream = self.stats.read().upstream_job_id.clone();
        if upstream.is_empty() {
            return Err(JobServiceError::Internal(format!(
                "job {} is not a periodic execution",
                self.job_id
            )));
        }
        self.env
            .store
            .zadd(&self.env.keys.executions(&upstream), -1, &self.job_id)
            .await
    }

    /// Apply a status transition, never moving the job backwards.
    ///
    /// Rejected (stale) updates and store failures are queued for the
    /// restorer and reported to the caller.
    ///
    /// # Errors
    ///
    /// `StatusMismatch` for a stale update; `Backend` on store failures.
    pub async fn update_status_with_retry(&self, target: Status) -> Result<()> {
        match self.apply_status(target).await {
            Ok(_) => Ok(()),
            Err(err @ (JobServiceError::StatusMismatch { .. } | JobServiceError::Backend(_))) => {
                if let Err(push_err) = self.push_for_retry(target).await {
                    error!(
                        job_id = %self.job_id,
                        target = %target,
                        error = %push_err,
                        "Failed to queue status change for retry"
                    );
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a status transition without queuing on failure. Returns false
    /// when the job already had `target`.
    ///
    /// # Errors
    ///
    /// `StatusMismatch` for a stale update; `NotFound` when the stats are
    /// gone; `Backend` on store failures or persistent write races.
    pub async fn apply_status(&self, target: Status) -> Result<bool> {
        let key = self.key();
        for _ in 0..CAS_ATTEMPTS {
            let raw = self
                .env
                .store
                .hget(&key, "status")
                .await?
                .ok_or_else(|| JobServiceError::NotFound(format!("job {}", self.job_id)))?;
            let current: Status = raw.parse().map_err(|_| {
                JobServiceError::Internal(format!("job {} has invalid status {raw}", self.job_id))
            })?;
            if current == target {
                self.stats.write().status = current;
                return Ok(false);
            }
            if target.compare(current) <= 0 {
                self.stats.write().status = current;
                return Err(JobServiceError::StatusMismatch { current, target });
            }

            let now = self.env.clock.unix();
            let mut fields = vec![
                ("status".to_string(), target.to_string()),
                ("update_time".to_string(), now.to_string()),
            ];
            if target == Status::Error {
                fields.push(("die_at".to_string(), now.to_string()));
            }
            if self.env.store.hset_if(&key, "status", &raw, &fields).await? {
                let snapshot = {
                    let mut stats = self.stats.write();
                    stats.status = target;
                    stats.update_time = now;
                    if target == Status::Error {
                        stats.die_at = now;
                    }
                    stats.clone()
                };
                debug!(job_id = %self.job_id, from = %current, to = %target, "Job status changed");
                self.fire_hook(StatusChange {
                    job_id: self.job_id.clone(),
                    status: target,
                    check_in: None,
                    metadata: Some(snapshot),
                })
                .await;
                return Ok(true);
            }
        }
        Err(JobServiceError::Backend(format!(
            "status of job {} kept changing concurrently",
            self.job_id
        )))
    }

    async fn push_for_retry(&self, target: Status) -> Result<()> {
        let change = SimpleStatusChange {
            job_id: self.job_id.clone(),
            target_status: target,
            revision: self.stats.read().revision,
        };
        self.env
            .store
            .zadd(
                &self.env.keys.status_change_events(),
                self.env.clock.unix_millis(),
                &serde_json::to_string(&change)?,
            )
            .await?;
        debug!(job_id = %self.job_id, target = %target, "Status change queued for retry");
        Ok(())
    }

    async fn fire_hook(&self, change: StatusChange) {
        let Some(callback) = &self.env.callback else {
            return;
        };
        let url = self.stats.read().web_hook_url.clone();
        if url.is_empty() {
            return;
        }
        if let Err(e) = callback.on_status_change(&url, change).await {
            warn!(job_id = %self.job_id, error = %e, "Status hook not triggered");
        }
    }
}
