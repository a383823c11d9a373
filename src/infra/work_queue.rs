//! Store-backed job queues.
//!
//! Records move between four sorted sets: `jobs` (ready, FIFO by enqueue
//! millis), `scheduled` (score = run-at epoch), `retry` (score = next attempt
//! epoch) and `dead` (score = failure epoch). A record taken by a worker pool
//! sits in that pool's in-progress set until its run is over, so the records
//! of a pool that dies can be put back on the ready queue.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::keys::Keys;
use super::store::{ScoreRange, ScoredMember, SharedStore, StoreOp};
use crate::core::error::{JobServiceError, Result};
use crate::core::models::{periodic_execution_id, Parameters, PERIODIC_EXECUTION_MARK};

/// Due records moved per requeue pass and set.
const REQUEUE_BATCH: usize = 100;

/// Attempts to claim the head of the ready queue when other pools win the
/// race for it.
const CLAIM_ATTEMPTS: usize = 3;

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Serialized unit of work held in the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Registered job name.
    pub name: String,
    /// Job ID; the policy ID for periodic executions.
    pub id: String,
    /// Unix seconds the record was created.
    #[serde(rename = "t")]
    pub enqueued_at: i64,
    /// Job parameters.
    #[serde(default)]
    pub args: Parameters,
    /// Whether the submission holds a unique claim.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
    /// Failed attempts so far.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fails: i64,
    /// Last error message.
    #[serde(default, rename = "err", skip_serializing_if = "String::is_empty")]
    pub last_err: String,
    /// Unix seconds of the last failure.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failed_at: i64,
}

impl JobRecord {
    /// New record with no failure history.
    #[must_use]
    pub fn new(name: impl Into<String>, id: impl Into<String>, args: Parameters, now: i64) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            enqueued_at: now,
            args,
            unique: false,
            fails: 0,
            last_err: String::new(),
            failed_at: 0,
        }
    }

    /// Fire epoch when this record is a periodic execution.
    #[must_use]
    pub fn periodic_mark(&self) -> Option<i64> {
        self.args.get(PERIODIC_EXECUTION_MARK).and_then(|v| v.as_i64())
    }

    /// ID under which the job is tracked.
    #[must_use]
    pub fn tracking_id(&self) -> String {
        self.periodic_mark().map_or_else(
            || self.id.clone(),
            |epoch| periodic_execution_id(&self.id, epoch),
        )
    }

    /// Serialize to the queue member format.
    ///
    /// # Errors
    ///
    /// Fails only if the parameters cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue member.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed members.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A ready record moved into a pool's in-progress set.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRecord {
    /// Member exactly as stored; needed to finish or release the claim.
    pub member: String,
    /// Decoded record.
    pub record: JobRecord,
}

/// Key guarding a unique submission: job name plus canonical JSON of the
/// parameters (maps are ordered, so equal parameters give equal keys).
///
/// # Errors
///
/// Fails only if the parameters cannot be serialized.
pub fn unique_key(keys: &Keys, name: &str, args: &Parameters) -> Result<String> {
    Ok(keys.unique_job(name, &serde_json::to_string(args)?))
}

/// Queue operations over the shared store.
#[derive(Clone)]
pub struct WorkQueue {
    store: SharedStore,
    keys: Keys,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("namespace", &self.keys.namespace())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Create queue operations for a namespace.
    #[must_use]
    pub const fn new(store: SharedStore, keys: Keys) -> Self {
        Self { store, keys }
    }

    /// Key layout in use.
    #[must_use]
    pub const fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Push a record onto the ready queue.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn enqueue(&self, record: &JobRecord, now_millis: i64) -> Result<()> {
        self.store
            .zadd(&self.keys.jobs(), now_millis, &record.encode()?)
            .await
    }

    /// Park a record until `run_at` (unix seconds).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn schedule(&self, record: &JobRecord, run_at: i64) -> Result<()> {
        self.store
            .zadd(&self.keys.scheduled(), run_at, &record.encode()?)
            .await
    }

    /// Move the oldest ready record into the in-progress set of `pool_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a malformed member is dropped from the
    /// in-progress set and reported as a serialization error.
    pub async fn claim(&self, pool_id: &str, now_millis: i64) -> Result<Option<ClaimedRecord>> {
        let ready = self.keys.jobs();
        let in_progress = self.keys.in_progress(pool_id);
        for _ in 0..CLAIM_ATTEMPTS {
            let head = self
                .store
                .zrange_by_score(&ready, ScoreRange::all().page(0, 1))
                .await?;
            let Some(ScoredMember { member, .. }) = head.into_iter().next() else {
                return Ok(None);
            };
            if !self.store.zmove(&ready, &in_progress, &member, now_millis).await? {
                continue;
            }
            return match JobRecord::decode(&member) {
                Ok(record) => Ok(Some(ClaimedRecord { member, record })),
                Err(e) => {
                    self.store.zrem(&in_progress, &member).await?;
                    Err(e)
                }
            };
        }
        Ok(None)
    }

    /// Drop a finished claim.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn finish(&self, pool_id: &str, member: &str) -> Result<bool> {
        self.store.zrem(&self.keys.in_progress(pool_id), member).await
    }

    /// Put a claimed record that was not run back on the ready queue.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn release(&self, pool_id: &str, member: &str, now_millis: i64) -> Result<bool> {
        self.store
            .zmove(&self.keys.in_progress(pool_id), &self.keys.jobs(), member, now_millis)
            .await
    }

    /// Move every record claimed by `pool_id` back to the ready queue,
    /// oldest claim first. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn requeue_in_progress(&self, pool_id: &str, now_millis: i64) -> Result<usize> {
        let in_progress = self.keys.in_progress(pool_id);
        let ready = self.keys.jobs();
        let claimed = self
            .store
            .zrange_by_score(&in_progress, ScoreRange::all())
            .await?;
        let mut moved = 0usize;
        for entry in claimed {
            let score = now_millis.saturating_add(i64::try_from(moved).unwrap_or(0));
            if self.store.zmove(&in_progress, &ready, &entry.member, score).await? {
                moved += 1;
            }
        }
        if moved > 0 {
            warn!(pool_id, moved, "Requeued records of a dead worker pool");
        }
        Ok(moved)
    }

    /// Move scheduled and retry records that are due at `now` onto the ready
    /// queue. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn requeue_due(&self, now: i64, now_millis: i64) -> Result<usize> {
        let ready = self.keys.jobs();
        let mut moved = 0usize;
        for source in [self.keys.scheduled(), self.keys.retry()] {
            let due = self
                .store
                .zrange_by_score(&source, ScoreRange::between(i64::MIN, now).page(0, REQUEUE_BATCH))
                .await?;
            for entry in due {
                let score = now_millis.saturating_add(i64::try_from(moved).unwrap_or(0));
                if self.store.zmove(&source, &ready, &entry.member, score).await? {
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            debug!(moved, "Requeued due records");
        }
        Ok(moved)
    }

    /// Place a failed record in the retry set until `retry_at`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn retry_later(&self, record: &JobRecord, retry_at: i64) -> Result<()> {
        self.store
            .zadd(&self.keys.retry(), retry_at, &record.encode()?)
            .await
    }

    /// Place a record that exhausted its budget in the dead set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bury(&self, record: &JobRecord, now: i64) -> Result<()> {
        self.store
            .zadd(&self.keys.dead(), now, &record.encode()?)
            .await
    }

    /// Remove the scheduled record of `job_id` that fires at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no matching record exists.
    pub async fn delete_scheduled(&self, run_at: i64, job_id: &str) -> Result<()> {
        let key = self.keys.scheduled();
        let candidates = self
            .store
            .zrange_by_score(&key, ScoreRange::between(run_at, run_at))
            .await?;
        for entry in candidates {
            match JobRecord::decode(&entry.member) {
                Ok(record) if record.tracking_id() == job_id => {
                    self.store.zrem(&key, &entry.member).await?;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping malformed scheduled record"),
            }
        }
        Err(JobServiceError::NotFound(format!(
            "scheduled job {job_id} at {run_at}"
        )))
    }

    /// Find the dead record of `job_id`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn find_dead(&self, job_id: &str) -> Result<Option<(String, JobRecord)>> {
        let dead = self
            .store
            .zrange_by_score(&self.keys.dead(), ScoreRange::all().rev())
            .await?;
        Ok(dead.into_iter().find_map(|entry| {
            JobRecord::decode(&entry.member)
                .ok()
                .filter(|record| record.tracking_id() == job_id)
                .map(|record| (entry.member, record))
        }))
    }

    /// Move a dead record back to the ready queue with a fresh fail counter.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn revive(&self, member: &str, mut record: JobRecord, now_millis: i64) -> Result<()> {
        record.fails = 0;
        record.last_err.clear();
        self.store
            .atomic(vec![
                StoreOp::ZRem {
                    key: self.keys.dead(),
                    member: member.to_string(),
                },
                StoreOp::ZAdd {
                    key: self.keys.jobs(),
                    score: now_millis,
                    member: record.encode()?,
                },
            ])
            .await
    }

    /// Drop periodic executions still parked in the scheduled set whose
    /// run-at is older than `before`. One-off scheduled jobs are kept.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear_stale_executions(&self, before: i64) -> Result<Vec<String>> {
        let key = self.keys.scheduled();
        let stale = self
            .store
            .zrange_by_score(&key, ScoreRange::between(i64::MIN, before.saturating_sub(1)))
            .await?;
        let mut removed = Vec::new();
        for entry in stale {
            let record = match JobRecord::decode(&entry.member) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed scheduled record");
                    continue;
                }
            };
            if record.periodic_mark().is_some() && self.store.zrem(&key, &entry.member).await? {
                removed.push(record.tracking_id());
            }
        }
        Ok(removed)
    }

    /// Number of records per queue: (ready, scheduled, retry, dead).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn depths(&self) -> Result<(usize, usize, usize, usize)> {
        let count = |key: String| {
            let store = self.store.clone();
            async move { store.zcount(&key, i64::MIN, i64::MAX).await }
        };
        Ok((
            count(self.keys.jobs()).await?,
            count(self.keys.scheduled()).await?,
            count(self.keys.retry()).await?,
            count(self.keys.dead()).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::models::ParamValue;
    use crate::infra::store::InMemoryStore;

    fn queue() -> WorkQueue {
        WorkQueue::new(Arc::new(InMemoryStore::new()), Keys::new("test"))
    }

    #[tokio::test]
    async fn test_ready_queue_is_fifo() {
        let q = queue();
        q.enqueue(&JobRecord::new("a", "1", Parameters::new(), 0), 20)
            .await
            .unwrap();
        q.enqueue(&JobRecord::new("a", "2", Parameters::new(), 0), 10)
            .await
            .unwrap();
        assert_eq!(q.claim("t", 0).await.unwrap().unwrap().record.id, "2");
        assert_eq!(q.claim("t", 0).await.unwrap().unwrap().record.id, "1");
        assert!(q.claim("t", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_tracks_record_until_finished() {
        let q = queue();
        q.enqueue(&JobRecord::new("a", "1", Parameters::new(), 0), 10)
            .await
            .unwrap();
        q.enqueue(&JobRecord::new("a", "2", Parameters::new(), 0), 20)
            .await
            .unwrap();

        let first = q.claim("p1", 30).await.unwrap().unwrap();
        assert_eq!(first.record.id, "1");
        let second = q.claim("p1", 31).await.unwrap().unwrap();
        assert!(q.claim("p1", 32).await.unwrap().is_none());

        assert!(q.finish("p1", &first.member).await.unwrap());
        assert!(q.release("p1", &second.member, 40).await.unwrap());
        assert_eq!(q.claim("t", 0).await.unwrap().unwrap().record.id, "2");
        assert_eq!(q.requeue_in_progress("p1", 50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_requeue_in_progress_of_one_pool() {
        let q = queue();
        for id in ["1", "2", "3"] {
            q.enqueue(&JobRecord::new("a", id, Parameters::new(), 0), 10)
                .await
                .unwrap();
        }
        q.claim("dead", 20).await.unwrap().unwrap();
        q.claim("dead", 21).await.unwrap().unwrap();
        q.claim("alive", 22).await.unwrap().unwrap();

        assert_eq!(q.requeue_in_progress("dead", 100).await.unwrap(), 2);
        assert_eq!(q.depths().await.unwrap().0, 2);
        assert_eq!(q.requeue_in_progress("alive", 100).await.unwrap(), 1);
        assert_eq!(q.claim("t", 0).await.unwrap().unwrap().record.id, "1");
    }

    #[tokio::test]
    async fn test_requeue_only_due_records() {
        let q = queue();
        q.schedule(&JobRecord::new("a", "due", Parameters::new(), 0), 100)
            .await
            .unwrap();
        q.schedule(&JobRecord::new("a", "later", Parameters::new(), 0), 500)
            .await
            .unwrap();
        q.retry_later(&JobRecord::new("a", "retry", Parameters::new(), 0), 50)
            .await
            .unwrap();

        assert_eq!(q.requeue_due(200, 1).await.unwrap(), 2);
        let (ready, scheduled, retry, dead) = q.depths().await.unwrap();
        assert_eq!((ready, scheduled, retry, dead), (2, 1, 0, 0));
    }

    #[tokio::test]
    async fn test_delete_scheduled_periodic_execution() {
        let q = queue();
        let mut args = Parameters::new();
        args.insert(PERIODIC_EXECUTION_MARK.into(), ParamValue::Int(120));
        let record = JobRecord::new("a", "policy", args, 0);
        assert_eq!(record.tracking_id(), "policy@120");
        q.schedule(&record, 120).await.unwrap();

        assert!(q.delete_scheduled(120, "policy").await.is_err());
        q.delete_scheduled(120, "policy@120").await.unwrap();
        assert_eq!(q.depths().await.unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_revive_dead_record() {
        let q = queue();
        let mut record = JobRecord::new("a", "x", Parameters::new(), 0);
        record.fails = 4;
        record.failed_at = 9;
        q.bury(&record, 9).await.unwrap();

        let (member, found) = q.find_dead("x").await.unwrap().unwrap();
        q.revive(&member, found, 1).await.unwrap();
        let revived = q.claim("t", 0).await.unwrap().unwrap().record;
        assert_eq!(revived.fails, 0);
        assert_eq!(revived.failed_at, 9);
        assert!(q.find_dead("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_stale_executions_keeps_one_off_jobs() {
        let q = queue();
        let mut args = Parameters::new();
        args.insert(PERIODIC_EXECUTION_MARK.into(), ParamValue::from("60"));
        q.schedule(&JobRecord::new("a", "p", args.clone(), 0), 60)
            .await
            .unwrap();
        args.insert(PERIODIC_EXECUTION_MARK.into(), ParamValue::from("600"));
        q.schedule(&JobRecord::new("a", "p", args, 0), 600)
            .await
            .unwrap();
        q.schedule(&JobRecord::new("a", "once", Parameters::new(), 0), 30)
            .await
            .unwrap();

        let removed = q.clear_stale_executions(300).await.unwrap();
        assert_eq!(removed, vec!["p@60".to_string()]);
        assert_eq!(q.depths().await.unwrap().1, 2);
    }
}
