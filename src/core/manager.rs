//! Read-side queries over tracked jobs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{JobServiceError, Result};
use super::lifecycle::LifecycleController;
use super::models::JobStats;
use crate::infra::store::ScoreRange;
use crate::infra::work_queue::JobRecord;

/// Page size used when a query does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Paging and filtering of a list query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    /// 1-based page number.
    pub page_number: usize,
    /// Items per page.
    pub page_size: usize,
    /// Skip periodic executions that already finished.
    pub non_dead_only: bool,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: DEFAULT_PAGE_SIZE,
            non_dead_only: false,
        }
    }
}

impl JobQuery {
    fn offset_limit(&self) -> (usize, usize) {
        let size = if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        };
        (self.page_number.max(1).saturating_sub(1).saturating_mul(size), size)
    }
}

/// One page of job stats plus the total number of matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    /// Stats on this page.
    pub jobs: Vec<JobStats>,
    /// Matches across all pages.
    pub total: usize,
}

/// Job queries backed by the secondary indices of the store.
#[derive(Debug, Clone)]
pub struct Manager {
    controller: Arc<LifecycleController>,
}

impl Manager {
    /// Create a manager.
    #[must_use]
    pub const fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    /// Stats of one job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs.
    pub async fn get_job(&self, job_id: &str) -> Result<JobStats> {
        if job_id.trim().is_empty() {
            return Err(JobServiceError::bad_request("empty job ID"));
        }
        Ok(self.controller.track(job_id).await?.job())
    }

    /// Persist stats, replacing any stored copy.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid stats; store failures otherwise.
    pub async fn save_job(&self, stats: JobStats) -> Result<()> {
        self.controller.new_tracker(stats).await.map(|_| ())
    }

    /// Executions of periodic job `policy_id`, newest first.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown periodic job; store failures otherwise.
    pub async fn get_periodic_executions(&self, policy_id: &str, query: JobQuery) -> Result<JobPage> {
        self.controller.track(policy_id).await?;
        let key = self.controller.keys().executions(policy_id);
        let min = if query.non_dead_only { 0 } else { i64::MIN };
        let (offset, limit) = query.offset_limit();
        let store = self.controller.store();

        let total = store.zcount(&key, min, i64::MAX).await?;
        let members = store
            .zrange_by_score(&key, ScoreRange::between(min, i64::MAX).rev().page(offset, limit))
            .await?;
        let mut jobs = Vec::with_capacity(members.len());
        for entry in members {
            match self.controller.track(&entry.member).await {
                Ok(tracker) => jobs.push(tracker.job()),
                Err(JobServiceError::NotFound(_)) => {
                    debug!(job_id = %entry.member, "Execution stats expired, pruning");
                    store.zrem(&key, &entry.member).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(JobPage { jobs, total })
    }

    /// Jobs waiting in the delayed queue, earliest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn get_scheduled_jobs(&self, query: JobQuery) -> Result<JobPage> {
        let key = self.controller.keys().scheduled();
        let (offset, limit) = query.offset_limit();
        let store = self.controller.store();

        let total = store.zcount(&key, i64::MIN, i64::MAX).await?;
        let members = store
            .zrange_by_score(&key, ScoreRange::all().page(offset, limit))
            .await?;
        let mut jobs = Vec::with_capacity(members.len());
        for entry in members {
            let record = match JobRecord::decode(&entry.member) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed scheduled record");
                    continue;
                }
            };
            match self.controller.track(&record.tracking_id()).await {
                Ok(tracker) => jobs.push(tracker.job()),
                Err(JobServiceError::NotFound(_)) => {
                    debug!(job_id = %record.tracking_id(), "Scheduled job without stats");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(JobPage { jobs, total })
    }

    /// All tracked jobs, newest enqueue first. Index entries whose stats
    /// expired are pruned, so a page may come back short.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn get_jobs(&self, query: JobQuery) -> Result<JobPage> {
        let key = self.controller.keys().job_index();
        let (offset, limit) = query.offset_limit();
        let store = self.controller.store();

        let members = store
            .zrange_by_score(&key, ScoreRange::all().rev().page(offset, limit))
            .await?;
        let mut jobs = Vec::with_capacity(members.len());
        for entry in members {
            match self.controller.track(&entry.member).await {
                Ok(tracker) => jobs.push(tracker.job()),
                Err(JobServiceError::NotFound(_)) => {
                    debug!(job_id = %entry.member, "Job stats expired, pruning index");
                    store.zrem(&key, &entry.member).await?;
                }
                Err(e) => return Err(e),
            }
        }
        let total = store.zcount(&key, i64::MIN, i64::MAX).await?;
        Ok(JobPage { jobs, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::core::models::JobKind;
    use crate::core::status::Status;
    use crate::infra::keys::Keys;
    use crate::infra::store::{InMemoryStore, Store};
    use crate::util::ManualClock;

    fn manager() -> (Arc<InMemoryStore>, Manager) {
        let store = Arc::new(InMemoryStore::new());
        let controller = Arc::new(LifecycleController::new(
            store.clone(),
            Keys::new("mg"),
            Arc::new(ManualClock::at_unix(1_000)),
            None,
            LifecycleConfig::default(),
        ));
        (store, Manager::new(controller))
    }

    fn stats(id: &str, enqueue_time: i64) -> JobStats {
        JobStats {
            job_id: id.into(),
            job_name: "demo".into(),
            enqueue_time,
            ..JobStats::default()
        }
    }

    #[tokio::test]
    async fn test_get_jobs_newest_first_and_paged() {
        let (_, m) = manager();
        for i in 1..=5 {
            m.save_job(stats(&format!("j{i}"), i)).await.unwrap();
        }
        let page = m
            .get_jobs(JobQuery {
                page_number: 1,
                page_size: 2,
                non_dead_only: false,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<_> = page.jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, ["j5", "j4"]);

        let last = m
            .get_jobs(JobQuery {
                page_number: 3,
                page_size: 2,
                non_dead_only: false,
            })
            .await
            .unwrap();
        assert_eq!(last.jobs.len(), 1);
        assert_eq!(last.jobs[0].job_id, "j1");
    }

    #[tokio::test]
    async fn test_get_jobs_prunes_expired_entries() {
        let (store, m) = manager();
        m.save_job(stats("keep", 1)).await.unwrap();
        store.zadd("mg:job_index", 2, "gone").await.unwrap();

        let page = m.get_jobs(JobQuery::default()).await.unwrap();
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_periodic_executions_non_dead_only() {
        let (_, m) = manager();
        m.save_job(JobStats {
            job_kind: JobKind::Periodic,
            cron_spec: "* * * * *".into(),
            ..stats("pol", 1)
        })
        .await
        .unwrap();
        for run_at in [60, 120] {
            m.save_job(JobStats {
                job_kind: JobKind::Scheduled,
                status: Status::Scheduled,
                run_at,
                upstream_job_id: "pol".into(),
                ..stats(&format!("pol@{run_at}"), 1)
            })
            .await
            .unwrap();
        }
        let done = m.controller.track("pol@60").await.unwrap();
        done.periodic_execution_done().await.unwrap();

        let all = m.get_periodic_executions("pol", JobQuery::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.jobs[0].job_id, "pol@120");

        let live = m
            .get_periodic_executions(
                "pol",
                JobQuery {
                    non_dead_only: true,
                    ..JobQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(live.total, 1);
        assert_eq!(live.jobs[0].job_id, "pol@120");
    }
}
