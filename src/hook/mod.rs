//! Web hook delivery of job status changes.

pub mod agent;
pub mod client;

use serde::{Deserialize, Serialize};

use crate::core::error::{JobServiceError, Result};
use crate::core::models::StatusChange;
use crate::util::validate_url;

pub use agent::{HookAgent, ResendOutcome};
pub use client::{HookClient, HttpHookClient};

/// Hook notification waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Target endpoint.
    pub url: String,
    /// Human readable summary.
    pub message: String,
    /// Status change carried by the event.
    pub data: Option<StatusChange>,
    /// Unix seconds the event was created; drives expiry.
    pub timestamp: i64,
}

impl Event {
    /// Event for a status change of a job.
    #[must_use]
    pub fn for_change(url: &str, change: StatusChange, now: i64) -> Self {
        let mut message = format!("status change: job={}, status={}", change.job_id, change.status);
        if let Some(check_in) = change.check_in.as_deref().filter(|c| !c.is_empty()) {
            message.push_str(&format!(", check_in={check_in}"));
        }
        Self {
            url: url.to_string(),
            message,
            data: Some(change),
            timestamp: now,
        }
    }

    /// Check the event can be delivered.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an invalid URL or a missing payload.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.url)?;
        if self.data.is_none() {
            return Err(JobServiceError::bad_request("nil hook data"));
        }
        Ok(())
    }
}
