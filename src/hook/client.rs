//! HTTP delivery of hook events.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::Event;
use crate::core::error::{JobServiceError, Result};

/// Delivers one hook event.
#[async_trait]
pub trait HookClient: Send + Sync + 'static {
    /// Send `event` to its URL.
    async fn send_event(&self, event: &Event) -> Result<()>;
}

/// [`HookClient`] posting the status change as JSON.
#[derive(Debug, Clone)]
pub struct HttpHookClient {
    client: reqwest::Client,
}

impl HttpHookClient {
    /// Client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// `Internal` when the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| JobServiceError::Internal(format!("build hook http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HookClient for HttpHookClient {
    async fn send_event(&self, event: &Event) -> Result<()> {
        event.validate()?;
        let response = self
            .client
            .post(&event.url)
            .json(&event.data)
            .send()
            .await
            .map_err(JobServiceError::backend)?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            Err(JobServiceError::Backend(format!(
                "failed to report status change via hook, expect '200' but got '{}'",
                status.as_u16()
            )))
        } else {
            Err(JobServiceError::Backend(body))
        }
    }
}
