//! Per-node cache of periodic policies.
//!
//! The authoritative copy lives in the policies sorted set. Each node loads it
//! at start, follows the change channel, and reloads it in full every
//! `policy_reload_interval` to recover from missed notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::policy::{Policy, PolicyEvent, PolicyMessage};
use crate::core::error::{JobServiceError, Result};
use crate::infra::keys::Keys;
use crate::infra::store::{ScoreRange, SharedStore, Subscription};
use crate::runtime::system::SystemContext;

/// Wait before re-subscribing after the change channel closed.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Concurrent policy cache keyed by policy ID.
pub struct PolicyStore {
    store: SharedStore,
    keys: Keys,
    reload_interval: Duration,
    policies: RwLock<HashMap<String, Policy>>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("namespace", &self.keys.namespace())
            .field("policies", &self.len())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Empty cache; call [`PolicyStore::load`] or [`PolicyStore::serve`].
    #[must_use]
    pub fn new(store: SharedStore, keys: Keys, reload_interval: Duration) -> Self {
        Self {
            store,
            keys,
            reload_interval: reload_interval.max(Duration::from_secs(1)),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache with the stored policies. Malformed members are
    /// skipped. Returns how many policies were loaded.
    ///
    /// # Errors
    ///
    /// Store failures; the cache is left untouched.
    pub async fn load(&self) -> Result<usize> {
        let members = self
            .store
            .zrange_by_score(&self.keys.periodic_policies(), ScoreRange::all())
            .await?;
        let mut loaded = HashMap::with_capacity(members.len());
        for entry in members {
            match Policy::decode(&entry.member) {
                Ok(policy) if !policy.id.is_empty() => {
                    debug!(policy_id = %policy.id, "Load periodic job policy");
                    loaded.insert(policy.id.clone(), policy);
                }
                Ok(_) => error!(raw = %entry.member, "Policy without ID, skipping"),
                Err(e) => error!(raw = %entry.member, error = %e, "Malformed policy, skipping"),
            }
        }
        let count = loaded.len();
        *self.policies.write() = loaded;
        info!(count, "Load periodic job policies");
        Ok(count)
    }

    /// Cache a policy. An existing entry with the same ID is kept.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a policy without ID.
    pub fn add(&self, policy: Policy) -> Result<()> {
        if policy.id.trim().is_empty() {
            return Err(JobServiceError::bad_request("malformed policy to add"));
        }
        self.policies.write().entry(policy.id.clone()).or_insert(policy);
        Ok(())
    }

    /// Drop a policy from the cache, returning it if it was present.
    pub fn remove(&self, policy_id: &str) -> Option<Policy> {
        if policy_id.is_empty() {
            return None;
        }
        self.policies.write().remove(policy_id)
    }

    /// Cached policy by ID.
    #[must_use]
    pub fn get(&self, policy_id: &str) -> Option<Policy> {
        self.policies.read().get(policy_id).cloned()
    }

    /// Number of cached policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.read().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Copy of the cached policies.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Policy> {
        self.policies.read().values().cloned().collect()
    }

    /// Visit a snapshot of the cache until `f` returns false. Changes made
    /// while iterating are not observed.
    pub fn iterate(&self, mut f: impl FnMut(&str, &Policy) -> bool) {
        for policy in self.snapshot() {
            if !f(&policy.id, &policy) {
                break;
            }
        }
    }

    /// Apply one change notification.
    ///
    /// # Errors
    ///
    /// `BadRequest` when the message carries no policy or an unschedule
    /// names an unknown policy.
    pub fn sync(&self, message: PolicyMessage) -> Result<()> {
        let policy = message.data.ok_or_else(|| {
            JobServiceError::bad_request("missing data in the policy sync message")
        })?;
        match message.event {
            PolicyEvent::Schedule => {
                let id = policy.id.clone();
                self.add(policy).map_err(|e| {
                    JobServiceError::bad_request(format!(
                        "failed to sync scheduled policy {id}: {e}"
                    ))
                })
            }
            PolicyEvent::UnSchedule => self.remove(&policy.id).map(|_| ()).ok_or_else(|| {
                JobServiceError::bad_request(format!(
                    "failed to sync unscheduled policy {}",
                    policy.id
                ))
            }),
        }
    }

    fn handle_raw(&self, raw: &str) {
        match serde_json::from_str::<PolicyMessage>(raw) {
            Ok(message) => {
                if let Err(e) = self.sync(message) {
                    error!(error = %e, "Policy sync failed");
                }
            }
            Err(e) => error!(raw = %raw, error = %e, "Read invalid policy message"),
        }
    }

    /// Load the cache, subscribe to the change channel and start the sync
    /// loop on `system`.
    ///
    /// # Errors
    ///
    /// Store failures during the initial load or subscription.
    pub async fn serve(self: &Arc<Self>, system: &SystemContext) -> Result<()> {
        let subscription = self
            .store
            .subscribe(&self.keys.policy_notifications())
            .await?;
        self.load().await?;
        system.spawn(Arc::clone(self).sync_loop(subscription, system.clone()));
        info!("Periodical job policy store is serving with policy auto sync enabled");
        Ok(())
    }

    async fn sync_loop(self: Arc<Self>, mut subscription: Subscription, system: SystemContext) {
        let cancel = system.cancellation().clone();
        let mut reload = tokio::time::interval(self.reload_interval);
        reload.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscription.next() => {
                    if let Some(raw) = message {
                        self.handle_raw(&raw);
                        continue;
                    }
                    warn!("Policy change channel closed, re-subscribing");
                    match self.resubscribe(&cancel).await {
                        Some(next) => subscription = next,
                        None => break,
                    }
                }
                _ = reload.tick() => {
                    if let Err(e) = self.load().await {
                        error!(error = %e, "Periodic policy reload failed");
                    }
                }
            }
        }
        info!("Periodical job policy store is stopped");
    }

    async fn resubscribe(&self, cancel: &CancellationToken) -> Option<Subscription> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
            }
            match self.store.subscribe(&self.keys.policy_notifications()).await {
                Ok(subscription) => {
                    // Notifications may have been missed while disconnected.
                    if let Err(e) = self.load().await {
                        error!(error = %e, "Policy reload after re-subscribe failed");
                    }
                    return Some(subscription);
                }
                Err(e) => error!(error = %e, "Re-subscribe to policy changes failed"),
            }
        }
    }
}
