//! Job life cycle controller and the dead-status restorer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{JobServiceError, Result};
use super::models::{JobStats, SimpleStatusChange};
use super::tracker::{HookCallback, Tracker, TrackerEnv};
use crate::config::LifecycleConfig;
use crate::infra::keys::Keys;
use crate::infra::store::SharedStore;
use crate::util::SharedClock;

/// Result of one restorer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The retry queue was empty.
    Empty,
    /// The queued status was applied.
    Applied,
    /// The entry was obsolete (stale, older revision, unknown job or
    /// malformed) and was dropped.
    Dropped,
}

/// Creates and resolves job trackers and reconciles status changes that could
/// not be applied immediately.
pub struct LifecycleController {
    env: TrackerEnv,
    config: LifecycleConfig,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("namespace", &self.env.keys.namespace())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Create a controller. `callback` receives status changes of jobs that
    /// carry a web hook URL.
    #[must_use]
    pub fn new(
        store: SharedStore,
        keys: Keys,
        clock: SharedClock,
        callback: Option<Arc<dyn HookCallback>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            env: TrackerEnv::new(store, keys, clock, callback),
            config,
        }
    }

    /// Store backing the trackers.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.env.store
    }

    /// Key layout in use.
    #[must_use]
    pub const fn keys(&self) -> &Keys {
        &self.env.keys
    }

    /// Clock in use.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.env.clock
    }

    /// Validate and persist new stats, returning their tracker.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid stats; store failures otherwise.
    pub async fn new_tracker(&self, stats: JobStats) -> Result<Arc<Tracker>> {
        stats.validate().map_err(|e| {
            JobServiceError::bad_request(format!("error occurred when creating job tracker: {e}"))
        })?;
        let tracker = Tracker::with_stats(stats, self.env.clone());
        tracker.save().await?;
        Ok(Arc::new(tracker))
    }

    /// Tracker of an existing job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs.
    pub async fn track(&self, job_id: &str) -> Result<Arc<Tracker>> {
        let tracker = Tracker::with_id(job_id, self.env.clone());
        tracker.load().await?;
        Ok(Arc::new(tracker))
    }

    /// Pop the oldest queued status change and try to apply it.
    ///
    /// An entry is dropped when it is malformed, its job is gone, its
    /// revision predates the job's, or the job already holds a status at
    /// least as new. Store failures put the entry back.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn restore_once(&self) -> Result<RestoreOutcome> {
        let queue = self.env.keys.status_change_events();
        let Some(entry) = self.env.store.zpop_min(&queue).await? else {
            return Ok(RestoreOutcome::Empty);
        };
        let change: SimpleStatusChange = match serde_json::from_str(&entry.member) {
            Ok(change) => change,
            Err(e) => {
                warn!(error = %e, "Dropping malformed status change");
                return Ok(RestoreOutcome::Dropped);
            }
        };

        let outcome = match self.track(&change.job_id).await {
            Ok(tracker) if change.revision < tracker.job().revision => {
                debug!(job_id = %change.job_id, revision = change.revision, "Status change belongs to an older revision");
                Ok(RestoreOutcome::Dropped)
            }
            Ok(tracker) => match tracker.apply_status(change.target_status).await {
                Ok(_) => Ok(RestoreOutcome::Applied),
                Err(JobServiceError::StatusMismatch { current, target }) => {
                    debug!(job_id = %change.job_id, %current, %target, "Status change is still stale");
                    Ok(RestoreOutcome::Dropped)
                }
                Err(JobServiceError::NotFound(_)) => Ok(RestoreOutcome::Dropped),
                Err(e) => Err(e),
            },
            Err(JobServiceError::NotFound(_)) => {
                debug!(job_id = %change.job_id, "Status change for an unknown job");
                Ok(RestoreOutcome::Dropped)
            }
            Err(e) => Err(e),
        };

        if outcome.is_err() {
            if let Err(e) = self.env.store.zadd(&queue, entry.score, &entry.member).await {
                error!(job_id = %change.job_id, error = %e, "Failed to put status change back");
            }
        }
        outcome
    }

    /// Run the restorer until `cancel` fires.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) {
        info!("Status restoring loop is started");
        loop {
            let wait = match self.restore_once().await {
                Ok(RestoreOutcome::Applied) => Duration::ZERO,
                Ok(RestoreOutcome::Dropped) => self.config.short_interval(),
                Ok(RestoreOutcome::Empty) => self.config.long_interval(),
                Err(e) => {
                    error!(error = %e, "Restore dead status error, retrying later");
                    self.config.short_interval()
                }
            };
            if cancel.is_cancelled() {
                break;
            }
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!("Status restoring loop is stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::Status;
    use crate::infra::store::{InMemoryStore, Store};
    use crate::util::SystemClock;

    fn controller() -> (Arc<InMemoryStore>, LifecycleController) {
        let store = Arc::new(InMemoryStore::new());
        let shared: SharedStore = store.clone();
        let ctl = LifecycleController::new(
            shared,
            Keys::new("lc"),
            Arc::new(SystemClock),
            None,
            LifecycleConfig::default(),
        );
        (store, ctl)
    }

    fn stats(id: &str) -> JobStats {
        JobStats {
            job_id: id.into(),
            job_name: "demo".into(),
            enqueue_time: 1,
            ..JobStats::default()
        }
    }

    async fn queue(store: &InMemoryStore, change: &SimpleStatusChange, score: i64) {
        store
            .zadd(
                "lc:status_change_events",
                score,
                &serde_json::to_string(change).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_tracker_rejects_invalid_stats() {
        let (_, ctl) = controller();
        let err = ctl.new_tracker(JobStats::default()).await.unwrap_err();
        assert!(matches!(err, JobServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_restore_applies_newer_status() {
        let (store, ctl) = controller();
        ctl.new_tracker(stats("a")).await.unwrap();
        queue(
            &store,
            &SimpleStatusChange {
                job_id: "a".into(),
                target_status: Status::Running,
                revision: 0,
            },
            1,
        )
        .await;

        assert_eq!(ctl.restore_once().await.unwrap(), RestoreOutcome::Applied);
        assert_eq!(ctl.track("a").await.unwrap().job().status, Status::Running);
        assert_eq!(ctl.restore_once().await.unwrap(), RestoreOutcome::Empty);
    }

    #[tokio::test]
    async fn test_restore_drops_stale_and_old_revision() {
        let (store, ctl) = controller();
        let t = ctl.new_tracker(stats("b")).await.unwrap();
        t.run().await.unwrap();
        t.stop().await.unwrap();

        queue(
            &store,
            &SimpleStatusChange {
                job_id: "b".into(),
                target_status: Status::Running,
                revision: 0,
            },
            1,
        )
        .await;
        assert_eq!(ctl.restore_once().await.unwrap(), RestoreOutcome::Dropped);

        store
            .hset("lc:job_stats:b", &[("revision".into(), "2".into())])
            .await
            .unwrap();
        queue(
            &store,
            &SimpleStatusChange {
                job_id: "b".into(),
                target_status: Status::Success,
                revision: 1,
            },
            2,
        )
        .await;
        assert_eq!(ctl.restore_once().await.unwrap(), RestoreOutcome::Dropped);
        assert_eq!(ctl.track("b").await.unwrap().job().status, Status::Stopped);
    }

    #[tokio::test]
    async fn test_restore_drops_malformed_entry() {
        let (store, ctl) = controller();
        store
            .zadd("lc:status_change_events", 1, "{not json")
            .await
            .unwrap();
        assert_eq!(ctl.restore_once().await.unwrap(), RestoreOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let (_, ctl) = controller();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(ctl).serve(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
