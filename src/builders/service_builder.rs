//! Bootstrap of a complete job service from configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::JobServiceConfig;
use crate::core::{
    HookCallback, Job, JobServiceError, LifecycleController, Manager, Result, WorkerPool,
};
use crate::hook::{HookAgent, HookClient, HttpHookClient};
use crate::infra::{InMemoryStore, Keys, SharedStore, WorkQueue};
use crate::period::PeriodicScheduler;
use crate::runtime::{JobController, SystemContext};
use crate::util::{new_node_id, SharedClock, SystemClock};

/// Assembles the job service components from a [`JobServiceConfig`].
///
/// Without an explicit store, `config.redis_url` selects the Redis backend
/// (feature `redis`); otherwise an in-process store is used.
pub struct JobServiceBuilder {
    config: JobServiceConfig,
    store: Option<SharedStore>,
    clock: Option<SharedClock>,
    hook_client: Option<Arc<dyn HookClient>>,
    jobs: HashMap<String, Arc<dyn Job>>,
    properties: HashMap<String, String>,
}

impl std::fmt::Debug for JobServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobServiceBuilder")
            .field("config", &self.config)
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl JobServiceBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: JobServiceConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            hook_client: None,
            jobs: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    /// Use `store` instead of the configured backend.
    #[must_use]
    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Deliver hooks through `client` instead of HTTP.
    #[must_use]
    pub fn with_hook_client(mut self, client: Arc<dyn HookClient>) -> Self {
        self.hook_client = Some(client);
        self
    }

    /// Register a job implementation under `name`.
    #[must_use]
    pub fn register_job(mut self, name: impl Into<String>, job: Arc<dyn Job>) -> Self {
        self.jobs.insert(name.into(), job);
        self
    }

    /// Ambient properties handed to every job context.
    #[must_use]
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    async fn open_store(config: &JobServiceConfig) -> Result<SharedStore> {
        match config.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => {
                let store = crate::infra::store::RedisStore::connect(url).await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis"))]
            Some(url) => Err(JobServiceError::bad_request(format!(
                "redis_url `{url}` configured but the `redis` feature is disabled"
            ))),
            None => Ok(Arc::new(InMemoryStore::new())),
        }
    }

    /// Validate the configuration and wire every component.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid configuration or job registrations; backend
    /// failures when the store cannot be reached.
    pub async fn build(self) -> Result<JobService> {
        let Self {
            config,
            store,
            clock,
            hook_client,
            jobs,
            properties,
        } = self;
        config.validate().map_err(JobServiceError::BadRequest)?;

        let store = match store {
            Some(store) => store,
            None => Self::open_store(&config).await?,
        };
        store.ping().await?;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let keys = Keys::new(config.namespace.clone());
        let node_id = config.node_id.clone().unwrap_or_else(new_node_id);

        let hook_client: Arc<dyn HookClient> = match hook_client {
            Some(client) => client,
            None => Arc::new(HttpHookClient::new(config.hook.http_timeout())?),
        };
        let hook_agent = Arc::new(HookAgent::new(
            config.hook.clone(),
            Arc::clone(&store),
            keys.clone(),
            Arc::clone(&clock),
            hook_client,
        ));
        let callback: Arc<dyn HookCallback> = hook_agent.clone();
        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            keys.clone(),
            clock,
            Some(callback),
            config.lifecycle.clone(),
        ));

        let queue = WorkQueue::new(Arc::clone(&store), keys);
        let scheduler = Arc::new(PeriodicScheduler::new(
            node_id.clone(),
            queue.clone(),
            Arc::clone(&controller),
            config.periodic.clone(),
        ));
        let pool = WorkerPool::new(
            node_id.clone(),
            config.worker_pool.clone(),
            queue,
            Arc::clone(&controller),
            scheduler,
        )?
        .with_properties(properties);
        pool.register_jobs(jobs)?;
        let pool = Arc::new(pool);

        let manager = Arc::new(Manager::new(Arc::clone(&controller)));
        let api = JobController::new(Arc::clone(&pool), Arc::clone(&manager));
        info!(node_id = %node_id, namespace = %config.namespace, "Job service assembled");

        Ok(JobService {
            node_id,
            system: SystemContext::new(),
            store,
            controller,
            hook_agent,
            pool,
            manager,
            api,
            started: AtomicBool::new(false),
        })
    }
}

/// A wired job service. Nothing runs until [`JobService::start`].
pub struct JobService {
    node_id: String,
    system: SystemContext,
    store: SharedStore,
    controller: Arc<LifecycleController>,
    hook_agent: Arc<HookAgent>,
    pool: Arc<WorkerPool>,
    manager: Arc<Manager>,
    api: JobController,
    started: AtomicBool,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("node_id", &self.node_id)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JobService {
    /// Identity of this node.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Shutdown context shared by the background loops.
    #[must_use]
    pub const fn system(&self) -> &SystemContext {
        &self.system
    }

    /// Backing store.
    #[must_use]
    pub const fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Life cycle controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Hook agent.
    #[must_use]
    pub const fn hook_agent(&self) -> &Arc<HookAgent> {
        &self.hook_agent
    }

    /// Worker pool.
    #[must_use]
    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Job queries.
    #[must_use]
    pub const fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Request-level API.
    #[must_use]
    pub const fn api(&self) -> &JobController {
        &self.api
    }

    /// Launch the status restorer, the hook loops, the periodic scheduler
    /// and the workers.
    ///
    /// # Errors
    ///
    /// `Internal` when already started; store failures otherwise.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(JobServiceError::Internal("job service is already started".into()));
        }
        self.system.spawn(
            Arc::clone(&self.controller).serve(self.system.cancellation().clone()),
        );
        self.hook_agent
            .serve(Arc::clone(&self.controller), &self.system)?;
        self.pool.start(&self.system).await?;
        info!(node_id = %self.node_id, "Job service is started");
        Ok(())
    }

    /// Stop every loop and the workers, waiting up to `timeout` for the
    /// loops to drain. Returns false when the timeout elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!(node_id = %self.node_id, "Job service is stopping");
        self.system.cancellation().cancel();
        let pool = Arc::clone(&self.pool);
        if let Err(e) = tokio::task::spawn_blocking(move || pool.stop()).await {
            warn!(error = %e, "Worker pool shutdown task failed");
        }
        let drained = self.system.shutdown(timeout).await;
        info!(node_id = %self.node_id, drained, "Job service is stopped");
        drained
    }
}
