//! Periodic scheduler: stores policies, announces them to every node and
//! drives the enqueuer and the stale-execution sweep.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::enqueuer::Enqueuer;
use super::policy::{Policy, PolicyMessage};
use super::policy_store::PolicyStore;
use crate::config::PeriodicConfig;
use crate::core::error::{JobServiceError, Result};
use crate::core::lifecycle::LifecycleController;
use crate::core::status::Status;
use crate::infra::store::{ScoreRange, SharedStore, StoreOp};
use crate::infra::work_queue::WorkQueue;
use crate::runtime::system::SystemContext;

/// Facade over the policy store and the enqueuer.
pub struct PeriodicScheduler {
    store: SharedStore,
    queue: WorkQueue,
    controller: Arc<LifecycleController>,
    policies: Arc<PolicyStore>,
    enqueuer: Arc<Enqueuer>,
    config: PeriodicConfig,
}

impl std::fmt::Debug for PeriodicScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicScheduler")
            .field("policies", &self.policies)
            .field("enqueuer", &self.enqueuer)
            .finish_non_exhaustive()
    }
}

impl PeriodicScheduler {
    /// Create a scheduler for `node_id`.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        queue: WorkQueue,
        controller: Arc<LifecycleController>,
        config: PeriodicConfig,
    ) -> Self {
        let store = Arc::clone(controller.store());
        let policies = Arc::new(PolicyStore::new(
            Arc::clone(&store),
            controller.keys().clone(),
            config.policy_reload_interval(),
        ));
        let enqueuer = Arc::new(Enqueuer::new(
            node_id,
            queue.clone(),
            Arc::clone(&controller),
            Arc::clone(&policies),
            config.clone(),
        ));
        Self {
            store,
            queue,
            controller,
            policies,
            enqueuer,
            config,
        }
    }

    /// Policy cache of this node.
    #[must_use]
    pub const fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Enqueuer of this node.
    #[must_use]
    pub const fn enqueuer(&self) -> &Arc<Enqueuer> {
        &self.enqueuer
    }

    /// Start the policy sync, the enqueuer and the stale-execution sweep.
    ///
    /// # Errors
    ///
    /// Store failures while loading policies or subscribing.
    pub async fn start(self: &Arc<Self>, system: &SystemContext) -> Result<()> {
        self.policies.serve(system).await?;
        system.spawn(Arc::clone(&self.enqueuer).serve(system.cancellation().clone()));
        system.spawn(Arc::clone(self).sweep_loop(system.clone()));
        info!("Basic scheduler is started");
        Ok(())
    }

    /// Store `policy`, materialize its first executions and announce it.
    /// Returns the numeric policy ID (the creation epoch, unique per
    /// namespace).
    ///
    /// # Errors
    ///
    /// `BadRequest` for an invalid policy; store failures otherwise.
    pub async fn schedule(&self, policy: Policy) -> Result<i64> {
        policy.validate()?;

        if let Err(e) = self.enqueuer.schedule_next_jobs(&policy).await {
            error!(policy_id = %policy.id, error = %e, "Immediate enqueue of periodic executions failed");
        }

        let key = self.controller.keys().periodic_policies();
        let mut numeric_id = self.controller.clock().unix();
        while self.store.zcount(&key, numeric_id, numeric_id).await? > 0 {
            numeric_id += 1;
        }

        let message = serde_json::to_string(&PolicyMessage::schedule(policy.clone()))?;
        self.store
            .atomic(vec![
                StoreOp::ZAdd {
                    key,
                    score: numeric_id,
                    member: policy.encode()?,
                },
                StoreOp::Publish {
                    channel: self.controller.keys().policy_notifications(),
                    message,
                },
            ])
            .await?;

        let policy_id = policy.id.clone();
        self.policies.add(policy)?;
        info!(policy_id = %policy_id, numeric_id, "Periodic job policy scheduled");
        Ok(numeric_id)
    }

    /// Remove the policy of periodic job `policy_id` and stop its pending
    /// executions. Cleanup of single executions is best effort.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown policies; store failures otherwise.
    pub async fn unschedule(&self, policy_id: &str) -> Result<()> {
        if policy_id.trim().is_empty() {
            return Err(JobServiceError::bad_request("bad periodic job ID: empty"));
        }
        let tracker = self.controller.track(policy_id).await?;
        let numeric_id = tracker.numeric_id()?;
        self.remove_policy(policy_id, numeric_id).await?;

        if let Err(e) = tracker.expire().await {
            error!(policy_id = %policy_id, error = %e, "Expire periodic job stats failed");
        }
        let stopped = tracker.stop().await;
        info!(policy_id = %policy_id, "Periodic job policy unscheduled");
        stopped
    }

    /// Drop the stored policy `policy_id` filed under `numeric_id`, announce
    /// the removal and stop its pending executions. The periodic job's own
    /// stats are not needed, so this also undoes a [`schedule`] whose job
    /// was never tracked.
    ///
    /// [`schedule`]: PeriodicScheduler::schedule
    ///
    /// # Errors
    ///
    /// `NotFound` when no such policy is stored; store failures otherwise.
    pub async fn remove_policy(&self, policy_id: &str, numeric_id: i64) -> Result<()> {
        let key = self.controller.keys().periodic_policies();
        let stored = self
            .store
            .zrange_by_score(&key, ScoreRange::between(numeric_id, numeric_id))
            .await?;
        let (member, policy) = stored
            .into_iter()
            .filter_map(|entry| Policy::decode(&entry.member).ok().map(|p| (entry.member, p)))
            .find(|(_, p)| p.id == policy_id)
            .ok_or_else(|| {
                JobServiceError::NotFound(format!(
                    "no valid periodic job policy found: {policy_id}:{numeric_id}"
                ))
            })?;

        let message = serde_json::to_string(&PolicyMessage::unschedule(policy))?;
        self.store
            .atomic(vec![
                StoreOp::ZRem { key, member },
                StoreOp::Publish {
                    channel: self.controller.keys().policy_notifications(),
                    message,
                },
            ])
            .await?;
        self.policies.remove(policy_id);
        self.stop_executions(policy_id).await;
        debug!(policy_id = %policy_id, numeric_id, "Periodic job policy removed");
        Ok(())
    }

    async fn stop_executions(&self, policy_id: &str) {
        let key = self.controller.keys().executions(policy_id);
        let executions = match self
            .store
            .zrange_by_score(&key, ScoreRange::between(0, i64::MAX))
            .await
        {
            Ok(executions) => executions,
            Err(e) => {
                error!(policy_id = %policy_id, error = %e, "Get executions of periodic job failed");
                return;
            }
        };
        if executions.is_empty() {
            debug!(policy_id = %policy_id, "No executions to stop");
        }
        for entry in executions {
            let execution_id = entry.member;
            let tracker = match self.controller.track(&execution_id).await {
                Ok(tracker) => tracker,
                Err(e) => {
                    error!(job_id = %execution_id, error = %e, "Track execution failed");
                    continue;
                }
            };
            let stats = tracker.job();
            if stats.status == Status::Scheduled {
                if let Err(e) = self.queue.delete_scheduled(stats.run_at, &execution_id).await {
                    debug!(job_id = %execution_id, error = %e, "Scheduled execution already left the scheduled set");
                }
            }
            if Status::Running.compare(stats.status) >= 0 {
                if let Err(e) = tracker.stop().await {
                    error!(job_id = %execution_id, error = %e, "Stop execution failed");
                }
            }
        }
    }

    /// Remove periodic executions that should have fired more than one
    /// horizon ago but are still parked. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn clear_dirty_jobs(&self) -> Result<usize> {
        let horizon = i64::try_from(self.config.horizon().as_secs()).unwrap_or(i64::MAX);
        let before = self.controller.clock().unix().saturating_sub(horizon);
        let removed = self.queue.clear_stale_executions(before).await?;
        for job_id in &removed {
            debug!(job_id = %job_id, "Removed dirty scheduled execution");
        }
        Ok(removed.len())
    }

    async fn sweep_loop(self: Arc<Self>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        loop {
            match self.clear_dirty_jobs().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Cleared dirty periodic executions"),
                Err(e) => warn!(error = %e, "Clear dirty periodic executions failed"),
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.horizon()) => {}
            }
        }
        info!("Basic scheduler is stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::LifecycleConfig;
    use crate::core::models::{JobKind, JobStats, Parameters};
    use crate::infra::keys::Keys;
    use crate::infra::store::{InMemoryStore, Store};
    use crate::util::ManualClock;

    const T0: i64 = 1_704_067_200;

    fn scheduler(store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>) -> PeriodicScheduler {
        let keys = Keys::new("ps");
        let controller = Arc::new(LifecycleController::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            None,
            LifecycleConfig::default(),
        ));
        PeriodicScheduler::new(
            "node",
            WorkQueue::new(store.clone(), keys),
            controller,
            PeriodicConfig::default(),
        )
    }

    fn policy(id: &str) -> Policy {
        Policy {
            id: id.into(),
            job_name: "gc".into(),
            cron_spec: "* * * * *".into(),
            job_params: Parameters::new(),
            web_hook_url: String::new(),
        }
    }

    async fn track_periodic(s: &PeriodicScheduler, id: &str, numeric_id: i64) {
        s.controller
            .new_tracker(JobStats {
                job_id: id.into(),
                job_name: "gc".into(),
                job_kind: JobKind::Periodic,
                status: Status::Scheduled,
                cron_spec: "* * * * *".into(),
                enqueue_time: T0,
                numeric_policy_id: numeric_id,
                ..JobStats::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_schedule_assigns_distinct_numeric_ids() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);

        let a = s.schedule(policy("a")).await.unwrap();
        let b = s.schedule(policy("b")).await.unwrap();
        assert_eq!(a, T0);
        assert_eq!(b, T0 + 1);
        assert_eq!(s.policies().len(), 2);
        // Immediate round: 4 executions per policy.
        assert_eq!(
            store.zcount("ps:scheduled", i64::MIN, i64::MAX).await.unwrap(),
            8
        );
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_cron() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);
        let mut p = policy("a");
        p.cron_spec = "every minute please".into();
        assert!(matches!(
            s.schedule(p).await,
            Err(JobServiceError::BadRequest(_))
        ));
        assert!(s.policies().is_empty());
    }

    #[tokio::test]
    async fn test_unschedule_stops_pending_executions() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);

        let numeric_id = s.schedule(policy("p")).await.unwrap();
        track_periodic(&s, "p", numeric_id).await;
        s.unschedule("p").await.unwrap();

        assert!(s.policies().get("p").is_none());
        assert_eq!(
            store.zcount("ps:period:policies", i64::MIN, i64::MAX).await.unwrap(),
            0
        );
        assert_eq!(
            store.zcount("ps:scheduled", i64::MIN, i64::MAX).await.unwrap(),
            0
        );
        let execution = s.controller.track(&format!("p@{T0}")).await.unwrap();
        assert_eq!(execution.job().status, Status::Stopped);

        // Later rounds produce nothing for the removed policy.
        clock.advance(Duration::from_secs(300));
        let report = s.enqueuer().check_and_enqueue().await;
        assert!(report.won);
        assert_eq!(report.scheduled, 0);
    }

    #[tokio::test]
    async fn test_remove_policy_without_tracked_job() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);
        let numeric_id = s.schedule(policy("p")).await.unwrap();

        assert!(matches!(
            s.remove_policy("p", numeric_id + 1).await,
            Err(JobServiceError::NotFound(_))
        ));
        s.remove_policy("p", numeric_id).await.unwrap();

        assert!(s.policies().is_empty());
        assert_eq!(
            store.zcount("ps:period:policies", i64::MIN, i64::MAX).await.unwrap(),
            0
        );
        assert_eq!(
            store.zcount("ps:scheduled", i64::MIN, i64::MAX).await.unwrap(),
            0
        );
        assert!(matches!(
            s.controller.track("p").await,
            Err(JobServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unschedule_unknown_policy() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);
        assert!(matches!(
            s.unschedule("nope").await,
            Err(JobServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_dirty_jobs() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let s = scheduler(&store, &clock);
        s.schedule(policy("p")).await.unwrap();

        clock.advance(Duration::from_secs(60 * 10));
        assert_eq!(s.clear_dirty_jobs().await.unwrap(), 4);
        assert_eq!(s.clear_dirty_jobs().await.unwrap(), 0);
    }
}
