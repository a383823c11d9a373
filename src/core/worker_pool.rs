//! Worker pool executing registered jobs from the shared queues.
//!
//! Records live in the store until a worker is free: a fetcher task takes one
//! worker permit, claims the oldest ready record into the pool's in-progress
//! set and hands both to a dedicated OS thread (see `native`). A requeuer
//! moves due scheduled and retry records onto the ready queue, and a
//! heartbeat publishes the pool's health for [`WorkerPool::stats`]. Records
//! claimed by a pool whose heartbeat went stale go back on the ready queue.
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = service.pool();
//! pool.register_job("scan-image", Arc::new(ScanImage))?;
//! let stats = pool.enqueue("scan-image", params, false, "").await?;
//! assert_eq!(stats.status, Status::Pending);
//! ```

mod native;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use self::native::{WorkerTask, WorkerThreads};
use super::error::{JobServiceError, Result};
use super::executor::Job;
use super::lifecycle::LifecycleController;
use super::models::{JobKind, JobStats, Parameters};
use super::runner::{JobRunner, NO_RETRY_FAILS};
use super::status::Status;
use super::tracker::STATS_TTL;
use crate::config::WorkerPoolConfig;
use crate::infra::store::{ScoreRange, SharedStore};
use crate::infra::work_queue::{unique_key, ClaimedRecord, JobRecord, WorkQueue};
use crate::period::{PeriodicScheduler, Policy};
use crate::runtime::system::SystemContext;
use crate::util::{new_job_id, ref_link, validate_url};

/// Time to live of a pool's heartbeat hash.
const HEARTBEAT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds to wait before retry number `fails`:
/// `fails^4 + 15 + rand(0..30) * (fails + 1)`.
#[must_use]
pub fn retry_backoff_secs(fails: i64) -> i64 {
    let fails = fails.clamp(0, 1_000);
    let jitter = rand::rng().random_range(0..30);
    fails.pow(4) + 15 + jitter * (fails + 1)
}

/// Health of a worker pool as seen through its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolHealth {
    /// Heartbeat is recent.
    Healthy,
    /// Heartbeat is older than the dead time.
    Dead,
}

/// Health report of one pool, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    /// Pool identity.
    pub worker_pool_id: String,
    /// Unix seconds the pool started.
    pub started_at: i64,
    /// Unix seconds of the last heartbeat.
    pub heartbeat_at: i64,
    /// Registered job names.
    pub job_names: Vec<String>,
    /// Worker threads.
    pub concurrency: usize,
    /// Derived health.
    pub status: PoolHealth,
}

/// Local execution counters of this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker threads.
    pub worker_count: usize,
    /// Jobs submitted through this pool.
    pub submitted_jobs: u64,
    /// Records handed to workers but not started.
    pub queued_jobs: u64,
    /// Jobs currently running.
    pub active_jobs: u64,
    /// Runs that finished without error.
    pub completed_jobs: u64,
    /// Runs that failed.
    pub failed_jobs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub submitted_jobs: AtomicU64,
    pub queued_jobs: AtomicU64,
    pub active_jobs: AtomicU64,
    pub completed_jobs: AtomicU64,
    pub failed_jobs: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            submitted_jobs: self.submitted_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            failed_jobs: self.failed_jobs.load(Ordering::Relaxed),
        }
    }
}

type Registry = RwLock<HashMap<String, Arc<dyn Job>>>;

/// State shared by the pool and its worker threads.
pub(crate) struct PoolShared {
    pool_id: String,
    queue: WorkQueue,
    store: SharedStore,
    controller: Arc<LifecycleController>,
    registry: Arc<Registry>,
    counters: Arc<PoolCounters>,
    runner: JobRunner,
}

impl PoolShared {
    /// Run one record to completion and route failures to the retry or dead
    /// set.
    pub(crate) async fn process(&self, claim: ClaimedRecord) {
        let ClaimedRecord { member, record } = claim;
        self.run_record(record).await;
        if let Err(e) = self.queue.finish(&self.pool_id, &member).await {
            error!(pool_id = %self.pool_id, error = %e, "Failed to clear in-progress record");
        }
    }

    async fn run_record(&self, mut record: JobRecord) {
        if record.unique {
            match unique_key(self.queue.keys(), &record.name, &record.args) {
                Ok(key) => {
                    if let Err(e) = self.store.del_if_eq(&key, &record.id).await {
                        warn!(job_id = %record.id, error = %e, "Release unique claim failed");
                    }
                }
                Err(e) => warn!(job_id = %record.id, error = %e, "Build unique key failed"),
            }
        }

        let job = self.registry.read().get(&record.name).cloned();
        let result = match job {
            Some(job) => self.runner.run(job.as_ref(), &mut record).await,
            None => {
                record.fails = NO_RETRY_FAILS;
                Err(anyhow::anyhow!("no job registered under name {}", record.name))
            }
        };

        match result {
            Ok(()) => {
                self.counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %record.tracking_id(), "Job run finished");
            }
            Err(e) => {
                self.counters.failed_jobs.fetch_add(1, Ordering::Relaxed);
                let max_fails = self
                    .registry
                    .read()
                    .get(&record.name)
                    .map_or(0, |job| self.runner.max_fails(job.as_ref()));
                self.handle_failure(record, &e.to_string(), max_fails).await;
            }
        }
    }

    async fn handle_failure(&self, mut record: JobRecord, err: &str, max_fails: i64) {
        let now = self.controller.clock().unix();
        record.fails = record.fails.saturating_add(1);
        record.last_err = err.to_string();
        record.failed_at = now;

        let job_id = record.tracking_id();
        let outcome = if record.fails < max_fails {
            let retry_at = now + retry_backoff_secs(record.fails);
            info!(job_id = %job_id, fails = record.fails, retry_at, "Job failed, retrying later");
            self.queue.retry_later(&record, retry_at).await
        } else {
            warn!(job_id = %job_id, fails = record.fails, error = %err, "Job failed permanently");
            self.queue.bury(&record, now).await
        };
        if let Err(e) = outcome {
            error!(job_id = %job_id, error = %e, "Failed to park failed job record");
        }
    }

    /// Put a record that was claimed but not run back on the ready queue.
    pub(crate) async fn give_back(&self, claim: &ClaimedRecord) {
        let millis = self.controller.clock().unix_millis();
        if let Err(e) = self.queue.release(&self.pool_id, &claim.member, millis).await {
            error!(job_id = %claim.record.tracking_id(), error = %e, "Failed to give back job record");
        }
    }
}

/// Pool of worker threads over the shared job queues.
pub struct WorkerPool {
    pool_id: String,
    config: WorkerPoolConfig,
    queue: WorkQueue,
    controller: Arc<LifecycleController>,
    scheduler: Arc<PeriodicScheduler>,
    registry: Arc<Registry>,
    counters: Arc<PoolCounters>,
    properties: Arc<HashMap<String, String>>,
    permits: Arc<Semaphore>,
    threads: Mutex<Option<Arc<WorkerThreads>>>,
    started_at: AtomicU64,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_id", &self.pool_id)
            .field("config", &self.config)
            .field("job_names", &self.job_names())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool; no thread runs before [`WorkerPool::start`].
    ///
    /// # Errors
    ///
    /// `BadRequest` for an invalid configuration.
    pub fn new(
        pool_id: impl Into<String>,
        config: WorkerPoolConfig,
        queue: WorkQueue,
        controller: Arc<LifecycleController>,
        scheduler: Arc<PeriodicScheduler>,
    ) -> Result<Self> {
        config.validate().map_err(JobServiceError::BadRequest)?;
        let permits = Arc::new(Semaphore::new(config.worker_count));
        Ok(Self {
            pool_id: pool_id.into(),
            config,
            queue,
            controller,
            scheduler,
            registry: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(PoolCounters::default()),
            properties: Arc::new(HashMap::new()),
            permits,
            threads: Mutex::new(None),
            started_at: AtomicU64::new(0),
        })
    }

    /// Ambient properties copied into every job context.
    #[must_use]
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = Arc::new(properties);
        self
    }

    /// Pool identity.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// The periodic scheduler owned by the pool.
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<PeriodicScheduler> {
        &self.scheduler
    }

    /// Register `job` under `name`.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an empty or already registered name.
    pub fn register_job(&self, name: &str, job: Arc<dyn Job>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(JobServiceError::bad_request("empty job name"));
        }
        let mut registry = self.registry.write();
        if registry.contains_key(name) {
            return Err(JobServiceError::bad_request(format!(
                "job name {name} is already registered"
            )));
        }
        registry.insert(name.to_string(), job);
        info!(job_name = name, "Job registered");
        Ok(())
    }

    /// Register several jobs, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`WorkerPool::register_job`].
    pub fn register_jobs(&self, jobs: HashMap<String, Arc<dyn Job>>) -> Result<()> {
        jobs.into_iter()
            .try_for_each(|(name, job)| self.register_job(&name, job))
    }

    /// Sorted names of the registered jobs.
    #[must_use]
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.registry.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// True when `name` is registered.
    #[must_use]
    pub fn is_known_job(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    /// Check that `name` is registered and accepts `params`.
    ///
    /// # Errors
    ///
    /// `BadRequest` for unknown jobs or rejected parameters.
    pub fn validate_job_parameters(&self, name: &str, params: &Parameters) -> Result<()> {
        let job = self
            .registry
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobServiceError::bad_request(format!("job with name '{name}' is unknown")))?;
        job.validate(params)
    }

    /// Local counters of this node.
    #[must_use]
    pub fn local_stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Start the workers, the fetcher, the requeuer, the heartbeat and the
    /// periodic scheduler.
    ///
    /// # Errors
    ///
    /// `Internal` when already started or a thread cannot be spawned; store
    /// failures from the scheduler start.
    pub async fn start(self: &Arc<Self>, system: &SystemContext) -> Result<()> {
        let shared = Arc::new(PoolShared {
            pool_id: self.pool_id.clone(),
            queue: self.queue.clone(),
            store: Arc::clone(self.controller.store()),
            controller: Arc::clone(&self.controller),
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&self.counters),
            runner: JobRunner::new(
                Arc::clone(&self.controller),
                Arc::clone(&self.properties),
                system.cancellation().clone(),
                self.config.default_max_fails,
            ),
        });
        {
            let mut threads = self.threads.lock();
            if threads.is_some() {
                return Err(JobServiceError::Internal("worker pool is already started".into()));
            }
            *threads = Some(Arc::new(WorkerThreads::spawn(&self.config, shared)?));
        }
        let now = self.controller.clock().unix();
        self.started_at
            .store(u64::try_from(now).unwrap_or_default(), Ordering::Relaxed);

        self.scheduler.start(system).await?;
        system.spawn(Arc::clone(self).fetch_loop(system.clone()));
        system.spawn(Arc::clone(self).requeue_loop(system.clone()));
        system.spawn(Arc::clone(self).heartbeat_loop(system.clone()));
        info!(
            pool_id = %self.pool_id,
            worker_count = self.config.worker_count,
            jobs = ?self.job_names(),
            "Worker pool is started"
        );
        Ok(())
    }

    /// Stop the worker threads. Records not yet started go back to the
    /// ready queue.
    pub fn stop(&self) {
        if let Some(threads) = self.threads.lock().take() {
            threads.shutdown();
        }
    }

    async fn fetch_loop(self: Arc<Self>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        let threads = self.threads.lock().clone();
        let Some(threads) = threads else {
            return;
        };
        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let millis = self.controller.clock().unix_millis();
            match self.queue.claim(&self.pool_id, millis).await {
                Ok(Some(claim)) => {
                    self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
                    if let Err(task) = threads.submit(WorkerTask { claim, permit }) {
                        self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                        warn!("Worker threads are gone, giving the record back");
                        threads.shared().give_back(&task.claim).await;
                        break;
                    }
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Fetch job record failed");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.fetch_interval()) => {}
            }
        }
        debug!(pool_id = %self.pool_id, "Fetch loop is stopped");
    }

    async fn requeue_loop(self: Arc<Self>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        loop {
            let clock = self.controller.clock();
            if let Err(e) = self.queue.requeue_due(clock.unix(), clock.unix_millis()).await {
                error!(error = %e, "Requeue due job records failed");
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.requeue_interval()) => {}
            }
        }
        debug!(pool_id = %self.pool_id, "Requeue loop is stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        loop {
            if let Err(e) = self.heartbeat().await {
                error!(pool_id = %self.pool_id, error = %e, "Worker pool heartbeat failed");
            }
            if let Err(e) = self.requeue_orphaned().await {
                error!(pool_id = %self.pool_id, error = %e, "Requeue of orphaned records failed");
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.heartbeat_interval()) => {}
            }
        }
        debug!(pool_id = %self.pool_id, "Heartbeat loop is stopped");
    }

    /// Publish this pool's heartbeat.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn heartbeat(&self) -> Result<()> {
        let store = self.controller.store();
        let keys = self.controller.keys();
        let now = self.controller.clock().unix();
        let key = keys.worker_pool(&self.pool_id);
        let fields = vec![
            ("pool_id".to_string(), self.pool_id.clone()),
            (
                "started_at".to_string(),
                self.started_at.load(Ordering::Relaxed).to_string(),
            ),
            ("heartbeat_at".to_string(), now.to_string()),
            ("job_names".to_string(), self.job_names().join(",")),
            ("concurrency".to_string(), self.config.worker_count.to_string()),
        ];
        store.hset(&key, &fields).await?;
        store.expire(&key, HEARTBEAT_TTL).await?;
        store.zadd(&keys.worker_pools(), now, &self.pool_id).await
    }

    fn is_dead(&self, heartbeat_at: i64) -> bool {
        let dead_time = i64::try_from(self.config.dead_time_secs).unwrap_or(i64::MAX);
        self.controller.clock().unix() - heartbeat_at > dead_time
    }

    /// Put the in-progress records of other pools whose heartbeat is older
    /// than the dead time back on the ready queue. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn requeue_orphaned(&self) -> Result<usize> {
        let store = self.controller.store();
        let keys = self.controller.keys();
        let millis = self.controller.clock().unix_millis();
        let mut moved = 0;
        for entry in store.zrange_by_score(&keys.worker_pools(), ScoreRange::all()).await? {
            if entry.member == self.pool_id {
                continue;
            }
            let heartbeat_at = store
                .hget(&keys.worker_pool(&entry.member), "heartbeat_at")
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(entry.score);
            if self.is_dead(heartbeat_at) {
                moved += self.queue.requeue_in_progress(&entry.member, millis).await?;
            }
        }
        Ok(moved)
    }

    /// Health of every pool that published a heartbeat. Pools whose
    /// heartbeat hash expired are unregistered once their in-progress
    /// records are back on the ready queue.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn stats(&self) -> Result<Vec<WorkerPoolStats>> {
        let store = self.controller.store();
        let keys = self.controller.keys();
        let millis = self.controller.clock().unix_millis();

        let mut pools = Vec::new();
        for entry in store.zrange_by_score(&keys.worker_pools(), ScoreRange::all()).await? {
            let fields = store.hgetall(&keys.worker_pool(&entry.member)).await?;
            if fields.is_empty() {
                self.queue.requeue_in_progress(&entry.member, millis).await?;
                store.zrem(&keys.worker_pools(), &entry.member).await?;
                continue;
            }
            let number = |name: &str| -> i64 {
                fields.get(name).and_then(|v| v.parse().ok()).unwrap_or_default()
            };
            let heartbeat_at = number("heartbeat_at");
            pools.push(WorkerPoolStats {
                worker_pool_id: entry.member.clone(),
                started_at: number("started_at"),
                heartbeat_at,
                job_names: fields
                    .get("job_names")
                    .map(|names| {
                        names
                            .split(',')
                            .filter(|n| !n.is_empty())
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                concurrency: usize::try_from(number("concurrency")).unwrap_or_default(),
                status: if self.is_dead(heartbeat_at) {
                    PoolHealth::Dead
                } else {
                    PoolHealth::Healthy
                },
            });
        }
        Ok(pools)
    }

    fn new_stats(&self, name: &str, params: &Parameters, is_unique: bool, hook: &str) -> JobStats {
        let job_id = new_job_id();
        let now = self.controller.clock().unix();
        JobStats {
            ref_link: ref_link(&job_id),
            job_id,
            status: Status::Pending,
            job_name: name.to_string(),
            job_kind: JobKind::Generic,
            is_unique,
            enqueue_time: now,
            update_time: now,
            web_hook_url: hook.to_string(),
            parameters: params.clone(),
            ..JobStats::default()
        }
    }

    fn check_request(&self, name: &str, params: &Parameters, hook: &str) -> Result<()> {
        self.validate_job_parameters(name, params)?;
        if !hook.is_empty() {
            validate_url(hook)?;
        }
        Ok(())
    }

    async fn claim_unique(&self, record: &JobRecord) -> Result<()> {
        let key = unique_key(self.queue.keys(), &record.name, &record.args)?;
        let claimed = self
            .controller
            .store()
            .set_nx(&key, &record.id, STATS_TTL)
            .await?;
        if claimed {
            Ok(())
        } else {
            Err(JobServiceError::Conflict(format!(
                "unique job {} with the same parameters is already queued",
                record.name
            )))
        }
    }

    async fn release_unique(&self, record: &JobRecord) {
        if let Ok(key) = unique_key(self.queue.keys(), &record.name, &record.args) {
            if let Err(e) = self.controller.store().del_if_eq(&key, &record.id).await {
                warn!(job_id = %record.id, error = %e, "Release unique claim failed");
            }
        }
    }

    /// Submit a job for immediate execution.
    ///
    /// # Errors
    ///
    /// `BadRequest` for unknown jobs or invalid parameters, `Conflict` for a
    /// duplicate unique job, store failures otherwise.
    pub async fn enqueue(
        &self,
        name: &str,
        params: Parameters,
        is_unique: bool,
        web_hook_url: &str,
    ) -> Result<JobStats> {
        self.check_request(name, &params, web_hook_url)?;
        let stats = self.new_stats(name, &params, is_unique, web_hook_url);
        let mut record = JobRecord::new(name, &stats.job_id, params, stats.enqueue_time);
        record.unique = is_unique;
        if is_unique {
            self.claim_unique(&record).await?;
        }

        let tracker = match self.controller.new_tracker(stats).await {
            Ok(tracker) => tracker,
            Err(e) => {
                if is_unique {
                    self.release_unique(&record).await;
                }
                return Err(e);
            }
        };
        let millis = self.controller.clock().unix_millis();
        if let Err(e) = self.queue.enqueue(&record, millis).await {
            if is_unique {
                self.release_unique(&record).await;
            }
            if let Err(fail_err) = tracker.fail().await {
                error!(job_id = %record.id, error = %fail_err, "Mark unqueued job failed");
            }
            return Err(e);
        }
        self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %record.id, job_name = name, "Job enqueued");
        Ok(tracker.job())
    }

    /// Submit a job to run `run_after_secs` seconds from now.
    ///
    /// # Errors
    ///
    /// As [`WorkerPool::enqueue`].
    pub async fn schedule(
        &self,
        name: &str,
        params: Parameters,
        run_after_secs: u64,
        is_unique: bool,
        web_hook_url: &str,
    ) -> Result<JobStats> {
        self.check_request(name, &params, web_hook_url)?;
        let mut stats = self.new_stats(name, &params, is_unique, web_hook_url);
        let delay = i64::try_from(run_after_secs).unwrap_or(i64::MAX);
        stats.run_at = stats.enqueue_time.saturating_add(delay);
        stats.job_kind = JobKind::Scheduled;
        stats.status = Status::Scheduled;
        let run_at = stats.run_at;

        let mut record = JobRecord::new(name, &stats.job_id, params, stats.enqueue_time);
        record.unique = is_unique;
        if is_unique {
            self.claim_unique(&record).await?;
        }

        let tracker = match self.controller.new_tracker(stats).await {
            Ok(tracker) => tracker,
            Err(e) => {
                if is_unique {
                    self.release_unique(&record).await;
                }
                return Err(e);
            }
        };
        if let Err(e) = self.queue.schedule(&record, run_at).await {
            if is_unique {
                self.release_unique(&record).await;
            }
            if let Err(fail_err) = tracker.fail().await {
                error!(job_id = %record.id, error = %fail_err, "Mark unqueued job failed");
            }
            return Err(e);
        }
        self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %record.id, job_name = name, run_at, "Job scheduled");
        Ok(tracker.job())
    }

    /// Submit a periodic job driven by `cron_spec`.
    ///
    /// # Errors
    ///
    /// `BadRequest` for unknown jobs, invalid parameters or an invalid cron
    /// spec; store failures otherwise.
    pub async fn periodically_enqueue(
        &self,
        name: &str,
        params: Parameters,
        cron_spec: &str,
        web_hook_url: &str,
    ) -> Result<JobStats> {
        self.check_request(name, &params, web_hook_url)?;
        let mut stats = self.new_stats(name, &params, false, web_hook_url);
        stats.job_kind = JobKind::Periodic;
        stats.status = Status::Scheduled;
        stats.cron_spec = cron_spec.to_string();

        let policy = Policy {
            id: stats.job_id.clone(),
            job_name: name.to_string(),
            cron_spec: cron_spec.to_string(),
            job_params: params,
            web_hook_url: web_hook_url.to_string(),
        };
        stats.validate()?;
        let job_id = stats.job_id.clone();
        let numeric_id = self.scheduler.schedule(policy).await?;
        stats.numeric_policy_id = numeric_id;

        let tracker = match self.controller.new_tracker(stats).await {
            Ok(tracker) => tracker,
            Err(e) => {
                if let Err(undo) = self.scheduler.remove_policy(&job_id, numeric_id).await {
                    error!(job_id = %job_id, error = %undo, "Remove untracked periodic policy failed");
                }
                return Err(e);
            }
        };
        self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %tracker.job_id(), job_name = name, cron_spec, "Periodic job scheduled");
        Ok(tracker.job())
    }

    /// Stop a job. Periodic jobs are unscheduled, scheduled jobs are removed
    /// from the delayed queue, running jobs are asked to stop. Finished jobs
    /// are left untouched.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs; store failures otherwise.
    pub async fn stop_job(&self, job_id: &str) -> Result<()> {
        let tracker = self.controller.track(job_id).await?;
        let stats = tracker.job();
        if stats.status.is_final() {
            debug!(job_id, status = %stats.status, "Job already finished, nothing to stop");
            return Ok(());
        }
        match stats.job_kind {
            JobKind::Periodic => self.scheduler.unschedule(job_id).await,
            JobKind::Scheduled => {
                if stats.status == Status::Scheduled {
                    match self.queue.delete_scheduled(stats.run_at, job_id).await {
                        Ok(()) | Err(JobServiceError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                tracker.stop().await
            }
            JobKind::Generic => tracker.stop().await,
        }
    }

    /// Retry a job that failed permanently.
    ///
    /// # Errors
    ///
    /// `BadRequest` when the job is not in Error; `NotFound` when the job or
    /// its dead record is unknown.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        let tracker = self.controller.track(job_id).await?;
        let status = tracker.cached_status();
        if status != Status::Error {
            return Err(JobServiceError::bad_request(format!(
                "only failed jobs can be retried, job {job_id} is {status}"
            )));
        }
        let (member, record) = self.queue.find_dead(job_id).await?.ok_or_else(|| {
            JobServiceError::NotFound(format!("dead record of job {job_id}"))
        })?;
        self.queue
            .revive(&member, record, self.controller.clock().unix_millis())
            .await?;
        info!(job_id, "Dead job moved back to the ready queue");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(threads) = self.threads.get_mut().take() {
            threads.detach();
        }
    }
}
