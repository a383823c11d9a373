//! Materializes periodic executions ahead of their fire times.
//!
//! Every node runs an enqueuer; a distributed lock plus a shared "last round"
//! stamp let only one of them expand the policies per round. The wait between
//! rounds adapts to whether this node won, so racing nodes spread out instead
//! of hitting the store in lockstep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::policy::Policy;
use super::policy_store::PolicyStore;
use crate::config::PeriodicConfig;
use crate::core::error::{JobServiceError, Result};
use crate::core::lifecycle::LifecycleController;
use crate::core::models::{
    periodic_execution_id, JobKind, JobStats, ParamValue, PERIODIC_EXECUTION_MARK,
};
use crate::core::status::Status;
use crate::infra::store::SharedStore;
use crate::infra::work_queue::{JobRecord, WorkQueue};
use crate::util::ref_link;

/// Added to the base wait after a round this node won.
const HIT_BACKOFF: Duration = Duration::from_secs(3);
/// Added on top of [`HIT_BACKOFF`] when the round hit an error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Taken off the base wait after a round another node won.
const MISS_ADVANCE: Duration = Duration::from_secs(3);
/// Upper bound of the random jitter added to every wait, in seconds.
const MAX_JITTER_SECS: u64 = 5;

/// Summary of one enqueue round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// This node won the round.
    pub won: bool,
    /// Executions materialized.
    pub scheduled: usize,
    /// Policies whose expansion stopped on an error.
    pub failed_policies: usize,
}

/// Periodic enqueuer of one node.
pub struct Enqueuer {
    node_id: String,
    store: SharedStore,
    queue: WorkQueue,
    controller: Arc<LifecycleController>,
    policies: Arc<PolicyStore>,
    config: PeriodicConfig,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Enqueuer {
    /// Create an enqueuer for `node_id`.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        queue: WorkQueue,
        controller: Arc<LifecycleController>,
        policies: Arc<PolicyStore>,
        config: PeriodicConfig,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store: Arc::clone(controller.store()),
            queue,
            controller,
            policies,
            config,
            last_error: Mutex::new(None),
        }
    }

    /// Identity used as the lock owner token.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Error of the most recent failed policy expansion, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Decide whether this node runs the current round: take the lock, and
    /// if the shared stamp is older than the base interval (or missing),
    /// refresh it and win. Store errors count as a lost round.
    pub async fn should_enqueue(&self) -> bool {
        let lock_key = self.controller.keys().periodic_lock();
        match self
            .store
            .set_nx(&lock_key, &self.node_id, self.config.lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(node_id = %self.node_id, "Periodic lock is held by another node");
                return false;
            }
            Err(e) => {
                error!(node_id = %self.node_id, error = %e, "Acquire periodic lock failed");
                return false;
            }
        }

        let decision = self.stamp_round().await;

        match self.store.del_if_eq(&lock_key, &self.node_id).await {
            Ok(true) => {}
            Ok(false) => debug!(node_id = %self.node_id, "Periodic lock expired before release"),
            Err(e) => error!(node_id = %self.node_id, error = %e, "Release periodic lock failed"),
        }

        decision.unwrap_or_else(|e| {
            error!(node_id = %self.node_id, error = %e, "Check last periodic enqueue stamp failed");
            false
        })
    }

    async fn stamp_round(&self) -> Result<bool> {
        let key = self.controller.keys().last_periodic_enqueue();
        let now = self.controller.clock().unix();
        let interval = i64::try_from(self.config.enqueue_interval().as_secs()).unwrap_or(i64::MAX);
        let stale = match self.store.get(&key).await? {
            None => true,
            Some(raw) => raw
                .parse::<i64>()
                .map_or(true, |last| last < now.saturating_sub(interval)),
        };
        if stale {
            self.store.set(&key, &now.to_string(), None).await?;
        }
        Ok(stale)
    }

    /// Run one round: when this node wins it, expand every cached policy.
    pub async fn check_and_enqueue(&self) -> RoundReport {
        if !self.should_enqueue().await {
            return RoundReport::default();
        }
        let mut report = RoundReport {
            won: true,
            ..RoundReport::default()
        };
        for policy in self.policies.snapshot() {
            match self.schedule_next_jobs(&policy).await {
                Ok(count) => report.scheduled += count,
                Err(e) => {
                    report.failed_policies += 1;
                    error!(policy_id = %policy.id, error = %e, "Schedule next periodic executions failed");
                    *self.last_error.lock() = Some(e.to_string());
                }
            }
        }
        info!(
            node_id = %self.node_id,
            policies = self.policies.len(),
            scheduled = report.scheduled,
            failed = report.failed_policies,
            "Periodic enqueue round finished"
        );
        report
    }

    /// Materialize the executions of `policy` firing in `[now, now + horizon)`.
    /// Executions that already exist are left alone. Stops at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an unparseable cron spec; store failures otherwise.
    pub async fn schedule_next_jobs(&self, policy: &Policy) -> Result<usize> {
        let schedule = policy.schedule()?;
        let now = self.controller.clock().now();
        let horizon = TimeDelta::from_std(self.config.horizon())
            .ok()
            .and_then(|ahead| now.checked_add_signed(ahead))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let fire_epochs: Vec<i64> = schedule
            .after(&(now - TimeDelta::seconds(1)))
            .skip_while(|t| *t < now)
            .take_while(|t| *t < horizon)
            .map(|t| t.timestamp())
            .collect();

        let mut scheduled = 0;
        for epoch in fire_epochs {
            if self.materialize(policy, epoch, now.timestamp()).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    async fn materialize(&self, policy: &Policy, epoch: i64, now: i64) -> Result<bool> {
        let execution_id = periodic_execution_id(&policy.id, epoch);
        match self.controller.track(&execution_id).await {
            Ok(_) => {
                debug!(job_id = %execution_id, "Periodic execution already exists");
                return Ok(false);
            }
            Err(JobServiceError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut args = policy.job_params.clone();
        args.insert(
            PERIODIC_EXECUTION_MARK.to_string(),
            ParamValue::String(epoch.to_string()),
        );
        let record = JobRecord::new(&policy.job_name, &policy.id, args, epoch);

        let stats = JobStats {
            job_id: execution_id.clone(),
            status: Status::Scheduled,
            job_name: policy.job_name.clone(),
            job_kind: JobKind::Scheduled,
            ref_link: ref_link(&execution_id),
            cron_spec: policy.cron_spec.clone(),
            enqueue_time: now,
            run_at: epoch,
            web_hook_url: policy.web_hook_url.clone(),
            upstream_job_id: policy.id.clone(),
            parameters: policy.job_params.clone(),
            ..JobStats::default()
        };
        let tracker = self.controller.new_tracker(stats).await?;

        if let Err(e) = self.queue.schedule(&record, epoch).await {
            if let Err(fail_err) = tracker.fail().await {
                error!(job_id = %execution_id, error = %fail_err, "Mark unqueued execution failed");
            }
            return Err(e);
        }
        debug!(job_id = %execution_id, run_at = epoch, "Scheduled periodic execution");
        Ok(true)
    }

    /// Wait before the next round. Winning (and erroring) pushes the next
    /// attempt back; losing brings it forward. A random jitter is added.
    #[must_use]
    pub fn next_turn(&self, report: &RoundReport) -> Duration {
        let mut wait = self.config.enqueue_interval();
        if report.won {
            wait += HIT_BACKOFF;
            if report.failed_policies > 0 {
                wait += ERROR_BACKOFF;
            }
        } else {
            wait = wait.saturating_sub(MISS_ADVANCE);
        }
        wait + Duration::from_secs(rand::rng().random_range(0..MAX_JITTER_SECS))
    }

    /// Run rounds until `cancel` fires. The first round starts immediately.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) {
        info!(node_id = %self.node_id, "Periodic enqueuer is started");
        loop {
            let report = self.check_and_enqueue().await;
            let wait = self.next_turn(&report);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!(node_id = %self.node_id, "Periodic enqueuer is stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::core::models::Parameters;
    use crate::infra::keys::Keys;
    use crate::infra::store::{InMemoryStore, Store};
    use crate::util::ManualClock;

    // 2024-01-01T00:00:00Z
    const T0: i64 = 1_704_067_200;

    fn enqueuer(node: &str, store: &Arc<InMemoryStore>, clock: &Arc<ManualClock>) -> Enqueuer {
        let keys = Keys::new("eq");
        let controller = Arc::new(LifecycleController::new(
            store.clone(),
            keys.clone(),
            clock.clone(),
            None,
            LifecycleConfig::default(),
        ));
        let policies = Arc::new(PolicyStore::new(
            store.clone(),
            keys.clone(),
            Duration::from_secs(600),
        ));
        Enqueuer::new(
            node,
            WorkQueue::new(store.clone(), keys),
            controller,
            policies,
            PeriodicConfig::default(),
        )
    }

    fn policy() -> Policy {
        Policy {
            id: "pol".into(),
            job_name: "gc".into(),
            cron_spec: "* * * * *".into(),
            job_params: Parameters::new(),
            web_hook_url: String::new(),
        }
    }

    #[tokio::test]
    async fn test_horizon_expansion() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let e = enqueuer("n1", &store, &clock);

        assert_eq!(e.schedule_next_jobs(&policy()).await.unwrap(), 4);
        let scheduled = store.zcount("eq:scheduled", i64::MIN, i64::MAX).await.unwrap();
        assert_eq!(scheduled, 4);
        for minute in 0..4 {
            let id = periodic_execution_id("pol", T0 + minute * 60);
            let stats = e.controller.track(&id).await.unwrap().job();
            assert_eq!(stats.status, Status::Scheduled);
            assert_eq!(stats.upstream_job_id, "pol");
        }
        assert!(e
            .controller
            .track(&periodic_execution_id("pol", T0 + 240))
            .await
            .is_err());

        // A second pass over the same window adds nothing.
        assert_eq!(e.schedule_next_jobs(&policy()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_winner_per_round() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let nodes: Vec<_> = (0..5)
            .map(|i| Arc::new(enqueuer(&format!("n{i}"), &store, &clock)))
            .collect();

        let handles: Vec<_> = nodes
            .iter()
            .map(|n| {
                let n = Arc::clone(n);
                tokio::spawn(async move { n.should_enqueue().await })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store.get("eq:period:lock").await.unwrap().is_none());

        clock.advance(Duration::from_secs(121));
        assert!(nodes[3].should_enqueue().await);
    }

    #[test]
    fn test_next_turn_bounds() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_unix(T0));
        let e = enqueuer("n1", &store, &clock);
        let base = Duration::from_secs(120);

        let miss = e.next_turn(&RoundReport::default());
        assert!(miss >= base - MISS_ADVANCE && miss < base - MISS_ADVANCE + Duration::from_secs(5));

        let hit = e.next_turn(&RoundReport {
            won: true,
            scheduled: 1,
            failed_policies: 0,
        });
        assert!(hit >= base + HIT_BACKOFF && hit < base + HIT_BACKOFF + Duration::from_secs(5));

        let failed = e.next_turn(&RoundReport {
            won: true,
            scheduled: 0,
            failed_policies: 1,
        });
        assert!(failed >= base + HIT_BACKOFF + ERROR_BACKOFF);
    }
}
