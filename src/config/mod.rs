//! Configuration models for the worker pool, periodic scheduling, hook
//! delivery and status restoring.

pub mod service;

pub use service::{
    HookConfig, JobServiceConfig, LifecycleConfig, PeriodicConfig, WorkerPoolConfig,
    DEFAULT_NAMESPACE,
};
