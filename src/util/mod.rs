//! Small shared helpers: clocks, identifiers, telemetry.

pub mod clock;
pub mod telemetry;

pub use clock::*;
pub use telemetry::*;

use crate::core::error::{JobServiceError, Result};

/// Generate a new opaque job identifier (32 lowercase hex characters).
#[must_use]
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate an identity for this node, used as the lock owner token.
#[must_use]
pub fn new_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().simple())
}

/// Check that `raw` is an absolute URL.
///
/// # Errors
///
/// Returns `BadRequest` when the URL does not parse.
pub fn validate_url(raw: &str) -> Result<()> {
    reqwest::Url::parse(raw)
        .map(|_| ())
        .map_err(|e| JobServiceError::bad_request(format!("invalid URL '{raw}': {e}")))
}

/// API link of a job.
#[must_use]
pub fn ref_link(job_id: &str) -> String {
    format!("/api/v1/jobs/{job_id}")
}
