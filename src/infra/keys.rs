//! Key layout of the shared store.
//!
//! Every key is prefixed with the deployment namespace so several deployments
//! can share one store.

/// Key builder bound to one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    /// Build keys for `namespace`. A trailing `:` is tolerated.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        while namespace.ends_with(':') {
            namespace.pop();
        }
        Self { namespace }
    }

    /// The namespace without trailing separator.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.namespace)
    }

    /// Delayed job records, score = run-at epoch.
    #[must_use]
    pub fn scheduled(&self) -> String {
        self.key("scheduled")
    }

    /// Ready job records, score = enqueue millis.
    #[must_use]
    pub fn jobs(&self) -> String {
        self.key("jobs")
    }

    /// Records one worker pool has taken but not finished, score = claim
    /// millis.
    #[must_use]
    pub fn in_progress(&self, pool_id: &str) -> String {
        self.key(&format!("jobs:{pool_id}:inprogress"))
    }

    /// Failed records waiting for their retry backoff.
    #[must_use]
    pub fn retry(&self) -> String {
        self.key("retry")
    }

    /// Records that exhausted their retry budget.
    #[must_use]
    pub fn dead(&self) -> String {
        self.key("dead")
    }

    /// Timestamp of the last periodic enqueue round.
    #[must_use]
    pub fn last_periodic_enqueue(&self) -> String {
        self.key("last_periodic_enqueue_h")
    }

    /// Periodic policies, score = numeric policy ID.
    #[must_use]
    pub fn periodic_policies(&self) -> String {
        self.key("period:policies")
    }

    /// Pub/sub channel for policy changes.
    #[must_use]
    pub fn policy_notifications(&self) -> String {
        self.key("period:policies:notifications")
    }

    /// Distributed lock guarding an enqueue round.
    #[must_use]
    pub fn periodic_lock(&self) -> String {
        self.key("period:lock")
    }

    /// Hash holding the stats of one job.
    #[must_use]
    pub fn job_stats(&self, job_id: &str) -> String {
        self.key(&format!("job_stats:{job_id}"))
    }

    /// Executions of one periodic policy, score = run-at epoch.
    #[must_use]
    pub fn executions(&self, upstream_job_id: &str) -> String {
        self.key(&format!("executions:{upstream_job_id}"))
    }

    /// Hook events waiting for redelivery.
    #[must_use]
    pub fn hook_events(&self) -> String {
        self.key("hook_events")
    }

    /// Status changes waiting to be re-applied.
    #[must_use]
    pub fn status_change_events(&self) -> String {
        self.key("status_change_events")
    }

    /// Claim for a unique job submission.
    #[must_use]
    pub fn unique_job(&self, job_name: &str, digest: &str) -> String {
        self.key(&format!("unique:{job_name}:{digest}"))
    }

    /// Set of registered worker pool IDs.
    #[must_use]
    pub fn worker_pools(&self) -> String {
        self.key("worker_pools")
    }

    /// Heartbeat hash of one worker pool.
    #[must_use]
    pub fn worker_pool(&self, pool_id: &str) -> String {
        self.key(&format!("worker_pools:{pool_id}"))
    }

    /// All tracked jobs, score = enqueue time.
    #[must_use]
    pub fn job_index(&self) -> String {
        self.key("job_index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("{harbor_job_service_namespace}:");
        assert_eq!(keys.namespace(), "{harbor_job_service_namespace}");
        assert_eq!(keys.scheduled(), "{harbor_job_service_namespace}:scheduled");
        assert_eq!(
            keys.policy_notifications(),
            "{harbor_job_service_namespace}:period:policies:notifications"
        );
        assert_eq!(keys.job_stats("abc"), "{harbor_job_service_namespace}:job_stats:abc");
        assert_eq!(keys.executions("p1"), "{harbor_job_service_namespace}:executions:p1");
    }
}
