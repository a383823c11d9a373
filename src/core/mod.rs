//! Job model, life cycle tracking and execution.

pub mod context;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod manager;
pub mod models;
pub mod runner;
pub mod status;
pub mod tracker;
pub mod worker_pool;

pub use context::{JobContext, OpCommand};
pub use error::{AppResult, ErrorKind, JobServiceError, Result};
pub use executor::Job;
pub use lifecycle::{LifecycleController, RestoreOutcome};
pub use manager::{JobPage, JobQuery, Manager, DEFAULT_PAGE_SIZE};
pub use models::{
    periodic_execution_id, JobKind, JobStats, ParamValue, Parameters, SimpleStatusChange,
    StatusChange, PERIODIC_EXECUTION_MARK,
};
pub use runner::{JobRunner, NO_RETRY_FAILS};
pub use status::Status;
pub use tracker::{HookCallback, Tracker, STATS_TTL};
pub use worker_pool::{retry_backoff_secs, PoolHealth, PoolStats, WorkerPool, WorkerPoolStats};
