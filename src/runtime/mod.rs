//! Process runtime: shutdown context and the request-level job API.

pub mod api;
pub mod system;

pub use api::{JobController, JobMetadata, JobRequest};
pub use system::SystemContext;
