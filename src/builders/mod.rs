//! Builders assembling the job service from configuration.

pub mod service_builder;

pub use service_builder::{JobService, JobServiceBuilder};
