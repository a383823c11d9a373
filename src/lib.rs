//! # Prometheus Job Service
//!
//! Distributed job execution core for services that run background work on
//! several nodes sharing one store.
//!
//! Jobs are registered by name, submitted as generic (run now), scheduled
//! (run once after a delay) or periodic (run on a cron spec), and tracked
//! through a forward-only status machine. Status changes are persisted per
//! job and optionally announced to a web hook.
//!
//! ## Components
//!
//! - **Lifecycle tracker**: persists job stats and applies status changes,
//!   never moving a job backwards. Writes that lose a race are queued and
//!   reconciled by the status restorer.
//! - **Periodic scheduler**: keeps the cron policies, and on every round one
//!   node (elected through a short-lived lock) materializes the executions
//!   falling in the next horizon.
//! - **Worker pool**: dedicated OS threads, each with its own single-threaded
//!   tokio runtime, pull records from the shared ready queue. Failed jobs are
//!   retried with backoff until their fail budget is spent.
//! - **Hook agent**: delivers status changes over HTTP with bounded
//!   concurrency and retries the ones that could not be delivered.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_jobservice::builders::JobServiceBuilder;
//! use prometheus_jobservice::config::JobServiceConfig;
//! use prometheus_jobservice::runtime::{JobMetadata, JobRequest};
//!
//! let service = JobServiceBuilder::new(JobServiceConfig::default())
//!     .register_job("scan-image", Arc::new(ScanImage))
//!     .build()
//!     .await?;
//! service.start().await?;
//!
//! let stats = service
//!     .api()
//!     .launch_job(JobRequest {
//!         name: "scan-image".into(),
//!         metadata: Some(JobMetadata {
//!             kind: "Generic".into(),
//!             ..JobMetadata::default()
//!         }),
//!         ..JobRequest::default()
//!     })
//!     .await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Job model, life cycle tracking and execution.
pub mod core;
/// Configuration models for the worker pool, scheduling and hooks.
pub mod config;
/// Builders to assemble the job service from configuration.
pub mod builders;
/// Shared-store adapters and queues.
pub mod infra;
/// Shutdown context and the request-level job API.
pub mod runtime;
/// Shared utilities.
pub mod util;
/// Web hook delivery.
pub mod hook;
/// Periodic (cron) job scheduling.
pub mod period;
