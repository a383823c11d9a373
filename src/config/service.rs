//! Job service configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default namespace prefix of every store key.
pub const DEFAULT_NAMESPACE: &str = "{jobservice_namespace}";

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of dedicated worker threads.
    pub worker_count: usize,
    /// Stack size of each worker thread in bytes.
    pub thread_stack_size: usize,
    /// Capacity of the hand-off channel between the fetcher and the workers.
    pub max_queue_depth: usize,
    /// Pause of the fetcher when the ready queue is empty, in milliseconds.
    pub fetch_interval_ms: u64,
    /// Period of the scheduled/retry requeuer, in milliseconds.
    pub requeue_interval_ms: u64,
    /// Period of the pool heartbeat, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Age of the last heartbeat after which a pool is reported dead, in seconds.
    pub dead_time_secs: u64,
    /// Failed attempts after which a record is moved to the dead set, unless
    /// the job overrides it.
    pub default_max_fails: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            thread_stack_size: 2 * 1024 * 1024,
            max_queue_depth: 64,
            fetch_interval_ms: 500,
            requeue_interval_ms: 1_000,
            heartbeat_interval_secs: 5,
            dead_time_secs: 10,
            default_max_fails: 4,
        }
    }
}

impl WorkerPoolConfig {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the hand-off channel capacity.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the fetcher idle pause.
    #[must_use]
    pub const fn with_fetch_interval_ms(mut self, ms: u64) -> Self {
        self.fetch_interval_ms = ms;
        self
    }

    /// Set the requeuer period.
    #[must_use]
    pub const fn with_requeue_interval_ms(mut self, ms: u64) -> Self {
        self.requeue_interval_ms = ms;
        self
    }

    /// Fetcher idle pause.
    #[must_use]
    pub const fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    /// Requeuer period.
    #[must_use]
    pub const fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }

    /// Heartbeat period.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Validate worker pool values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.fetch_interval_ms == 0 || self.requeue_interval_ms == 0 {
            return Err("fetch and requeue intervals must be greater than 0".into());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be greater than 0".into());
        }
        if self.dead_time_secs <= self.heartbeat_interval_secs {
            return Err("dead_time_secs must exceed heartbeat_interval_secs".into());
        }
        if self.default_max_fails == 0 {
            return Err("default_max_fails must be greater than 0".into());
        }
        Ok(())
    }
}

/// Periodic enqueuer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
    /// Base wait between enqueue rounds, in seconds.
    pub enqueue_interval_secs: u64,
    /// How far ahead executions are materialized, in seconds.
    pub horizon_secs: u64,
    /// Time to live of the enqueue lock, in seconds.
    pub lock_ttl_secs: u64,
    /// Period of the full policy reload, in seconds.
    pub policy_reload_interval_secs: u64,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            enqueue_interval_secs: 120,
            horizon_secs: 240,
            lock_ttl_secs: 30,
            policy_reload_interval_secs: 600,
        }
    }
}

impl PeriodicConfig {
    /// Base wait between rounds.
    #[must_use]
    pub const fn enqueue_interval(&self) -> Duration {
        Duration::from_secs(self.enqueue_interval_secs)
    }

    /// Materialization horizon.
    #[must_use]
    pub const fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_secs)
    }

    /// Lock time to live.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Full reload period.
    #[must_use]
    pub const fn policy_reload_interval(&self) -> Duration {
        Duration::from_secs(self.policy_reload_interval_secs)
    }

    /// Validate periodic values.
    pub fn validate(&self) -> Result<(), String> {
        if self.enqueue_interval_secs == 0 {
            return Err("enqueue_interval_secs must be greater than 0".into());
        }
        if self.horizon_secs < self.enqueue_interval_secs {
            return Err("horizon_secs must not be shorter than enqueue_interval_secs".into());
        }
        if self.lock_ttl_secs == 0 {
            return Err("lock_ttl_secs must be greater than 0".into());
        }
        if self.policy_reload_interval_secs == 0 {
            return Err("policy_reload_interval_secs must be greater than 0".into());
        }
        Ok(())
    }
}

/// Hook agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Capacity of the inbound event channel.
    pub channel_capacity: usize,
    /// Concurrent deliveries.
    pub max_handlers: usize,
    /// HTTP request timeout, in seconds.
    pub http_timeout_secs: u64,
    /// Events older than this are discarded, in days.
    pub max_event_age_days: u64,
    /// Retry loop wait after an error or a relevant pop, in seconds.
    pub retry_short_interval_secs: u64,
    /// Retry loop wait when the retry set is empty, in seconds.
    pub retry_long_interval_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_handlers: 5,
            http_timeout_secs: 15,
            max_event_age_days: 180,
            retry_short_interval_secs: 5,
            retry_long_interval_secs: 300,
        }
    }
}

impl HookConfig {
    /// HTTP request timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Maximum event age.
    #[must_use]
    pub const fn max_event_age(&self) -> Duration {
        Duration::from_secs(self.max_event_age_days * 24 * 60 * 60)
    }

    /// Retry loop short wait.
    #[must_use]
    pub const fn retry_short_interval(&self) -> Duration {
        Duration::from_secs(self.retry_short_interval_secs)
    }

    /// Retry loop long wait.
    #[must_use]
    pub const fn retry_long_interval(&self) -> Duration {
        Duration::from_secs(self.retry_long_interval_secs)
    }

    /// Validate hook values.
    pub fn validate(&self) -> Result<(), String> {
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".into());
        }
        if self.max_handlers == 0 {
            return Err("max_handlers must be greater than 0".into());
        }
        if self.http_timeout_secs == 0 {
            return Err("http_timeout_secs must be greater than 0".into());
        }
        if self.max_event_age_days == 0 {
            return Err("max_event_age_days must be greater than 0".into());
        }
        if self.retry_short_interval_secs == 0
            || self.retry_long_interval_secs < self.retry_short_interval_secs
        {
            return Err("retry intervals must be positive and long >= short".into());
        }
        Ok(())
    }
}

/// Status restorer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Wait after an error or a dropped entry, in seconds.
    pub restore_short_interval_secs: u64,
    /// Wait when the retry queue is empty, in seconds.
    pub restore_long_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            restore_short_interval_secs: 5,
            restore_long_interval_secs: 300,
        }
    }
}

impl LifecycleConfig {
    /// Short wait.
    #[must_use]
    pub const fn short_interval(&self) -> Duration {
        Duration::from_secs(self.restore_short_interval_secs)
    }

    /// Long wait.
    #[must_use]
    pub const fn long_interval(&self) -> Duration {
        Duration::from_secs(self.restore_long_interval_secs)
    }

    /// Validate restorer values.
    pub fn validate(&self) -> Result<(), String> {
        if self.restore_short_interval_secs == 0 {
            return Err("restore_short_interval_secs must be greater than 0".into());
        }
        if self.restore_long_interval_secs < self.restore_short_interval_secs {
            return Err("restore_long_interval_secs must be >= restore_short_interval_secs".into());
        }
        Ok(())
    }
}

/// Root job service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobServiceConfig {
    /// Key prefix isolating this deployment in the shared store.
    pub namespace: String,
    /// Identity of this node; generated when absent.
    pub node_id: Option<String>,
    /// Redis URL; the in-memory store is used when absent.
    pub redis_url: Option<String>,
    /// Worker pool settings.
    pub worker_pool: WorkerPoolConfig,
    /// Periodic scheduling settings.
    pub periodic: PeriodicConfig,
    /// Hook delivery settings.
    pub hook: HookConfig,
    /// Status restorer settings.
    pub lifecycle: LifecycleConfig,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            node_id: None,
            redis_url: None,
            worker_pool: WorkerPoolConfig::default(),
            periodic: PeriodicConfig::default(),
            hook: HookConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl JobServiceConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace must not be empty".into());
        }
        if self.node_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err("node_id must not be blank".into());
        }
        if let Some(url) = &self.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(format!("redis_url `{url}` must use the redis:// or rediss:// scheme"));
            }
        }
        self.worker_pool
            .validate()
            .map_err(|e| format!("worker_pool invalid: {e}"))?;
        self.periodic
            .validate()
            .map_err(|e| format!("periodic invalid: {e}"))?;
        self.hook.validate().map_err(|e| format!("hook invalid: {e}"))?;
        self.lifecycle
            .validate()
            .map_err(|e| format!("lifecycle invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `JOB_SERVICE_*` environment variables, loading a `.env` file
    /// first when present.
    ///
    /// Recognized: `JOB_SERVICE_NAMESPACE`, `JOB_SERVICE_NODE_ID`,
    /// `JOB_SERVICE_REDIS_URL`, `JOB_SERVICE_WORKER_COUNT`.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(ns) = lookup("JOB_SERVICE_NAMESPACE") {
            self.namespace = ns;
        }
        if let Some(id) = lookup("JOB_SERVICE_NODE_ID") {
            self.node_id = Some(id);
        }
        if let Some(url) = lookup("JOB_SERVICE_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Some(raw) = lookup("JOB_SERVICE_WORKER_COUNT") {
            self.worker_pool.worker_count = raw
                .parse()
                .map_err(|e| format!("JOB_SERVICE_WORKER_COUNT `{raw}` invalid: {e}"))?;
        }
        self.validate()
    }
}
