//! Bounded-concurrency hook dispatcher with a durable retry queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use super::client::HookClient;
use super::Event;
use crate::config::HookConfig;
use crate::core::error::{JobServiceError, Result};
use crate::core::lifecycle::LifecycleController;
use crate::core::models::StatusChange;
use crate::core::tracker::HookCallback;
use crate::infra::keys::Keys;
use crate::infra::store::SharedStore;
use crate::runtime::system::SystemContext;
use crate::util::SharedClock;

/// Result of one retry-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    /// The retry set was empty.
    Empty,
    /// The event was handed back to the dispatcher.
    Resubmitted,
    /// The event was expired, malformed or obsolete.
    Dropped,
}

/// Hook agent: `trigger` queues events, `serve` starts the dispatch and retry
/// loops.
pub struct HookAgent {
    config: HookConfig,
    store: SharedStore,
    keys: Keys,
    clock: SharedClock,
    client: Arc<dyn HookClient>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    tokens: Arc<Semaphore>,
}

impl std::fmt::Debug for HookAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookAgent")
            .field("config", &self.config)
            .field("available_tokens", &self.tokens.available_permits())
            .finish_non_exhaustive()
    }
}

impl HookAgent {
    /// Create an agent; nothing is delivered until [`HookAgent::serve`].
    #[must_use]
    pub fn new(
        config: HookConfig,
        store: SharedStore,
        keys: Keys,
        clock: SharedClock,
        client: Arc<dyn HookClient>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let tokens = Arc::new(Semaphore::new(config.max_handlers));
        Self {
            config,
            store,
            keys,
            clock,
            client,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tokens,
        }
    }

    /// Validate and queue an event for delivery.
    ///
    /// # Errors
    ///
    /// `BadRequest` for invalid events; `Internal` once the agent stopped.
    pub async fn trigger(&self, event: Event) -> Result<()> {
        event.validate()?;
        self.events_tx
            .send(event)
            .await
            .map_err(|_| JobServiceError::Internal("hook agent is stopped".into()))
    }

    /// Start the dispatch and retry loops on `system`.
    ///
    /// # Errors
    ///
    /// `Internal` when the agent is already serving.
    pub fn serve(
        self: &Arc<Self>,
        controller: Arc<LifecycleController>,
        system: &SystemContext,
    ) -> Result<()> {
        let rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| JobServiceError::Internal("hook agent is already serving".into()))?;

        system.spawn(Arc::clone(self).dispatch_loop(rx, system.clone()));
        info!("Basic hook agent is started");

        system.spawn(Arc::clone(self).retry_loop(controller, system.clone()));
        info!("Hook event retrying loop is started");
        Ok(())
    }

    /// Events waiting in the inbound channel.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.config
            .channel_capacity
            .saturating_sub(self.events_tx.capacity())
    }

    fn is_expired(&self, event: &Event) -> bool {
        let max_age = i64::try_from(self.config.max_event_age().as_secs()).unwrap_or(i64::MAX);
        event.timestamp > 0 && self.clock.unix() - event.timestamp >= max_age
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Event>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.tokens).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let agent = Arc::clone(&self);
            system.spawn(async move {
                let _permit = permit;
                agent.deliver(event).await;
            });
        }
        info!("Basic hook agent is stopped");
    }

    async fn deliver(&self, event: Event) {
        let Err(e) = self.client.send_event(&event).await else {
            debug!(url = %event.url, message = %event.message, "Hook event delivered");
            return;
        };
        error!(
            url = %event.url,
            message = %event.message,
            error = %e,
            "Send hook event failed, pushing to the retry queue"
        );
        if let Err(push_err) = self.push_for_retry(&event).await {
            error!(error = %push_err, "Failed to push hook event to the retry queue");
            let backoff = Duration::from_secs(rand::rng().random_range(5..=60));
            tokio::time::sleep(backoff).await;
            if self.events_tx.send(event).await.is_err() {
                warn!("Hook agent stopped, dropping event");
            }
        }
    }

    async fn push_for_retry(&self, event: &Event) -> Result<()> {
        if self.is_expired(event) {
            warn!(url = %event.url, message = %event.message, "Event is expired, dropping");
            return Ok(());
        }
        let raw = serde_json::to_string(event)?;
        self.store
            .zadd(&self.keys.hook_events(), self.clock.unix_millis(), &raw)
            .await
    }

    async fn retry_loop(self: Arc<Self>, controller: Arc<LifecycleController>, system: SystemContext) {
        let cancel = system.cancellation().clone();
        loop {
            let wait = match self.resend_once(&controller).await {
                Ok(ResendOutcome::Empty) => self.config.retry_long_interval(),
                Ok(ResendOutcome::Resubmitted | ResendOutcome::Dropped) => {
                    self.config.retry_short_interval()
                }
                Err(e) => {
                    error!(error = %e, "Resend hook event error");
                    self.config.retry_short_interval()
                }
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        info!("Hook event retrying loop exit");
    }

    /// Pop the oldest retry entry and resubmit it when still relevant: the
    /// job's tracked status is newer than the event's, or equal with a
    /// different check-in.
    ///
    /// # Errors
    ///
    /// Store failures; the entry is put back when the job could not be read.
    pub async fn resend_once(&self, controller: &LifecycleController) -> Result<ResendOutcome> {
        let key = self.keys.hook_events();
        let Some(entry) = self.store.zpop_min(&key).await? else {
            return Ok(ResendOutcome::Empty);
        };
        let event: Event = match serde_json::from_str(&entry.member) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed hook event");
                return Ok(ResendOutcome::Dropped);
            }
        };
        if self.is_expired(&event) {
            warn!(url = %event.url, message = %event.message, "Event is expired, dropping");
            return Ok(ResendOutcome::Dropped);
        }
        let Some(change) = event.data.as_ref().filter(|c| !c.job_id.is_empty()) else {
            warn!(message = %event.message, "Malformed job status change data, dropping");
            return Ok(ResendOutcome::Dropped);
        };

        let tracker = match controller.track(&change.job_id).await {
            Ok(tracker) => tracker,
            Err(JobServiceError::NotFound(_)) => return Ok(ResendOutcome::Dropped),
            Err(e) => {
                if let Err(put_err) = self.store.zadd(&key, entry.score, &entry.member).await {
                    error!(error = %put_err, "Failed to put hook event back");
                }
                return Err(e);
            }
        };
        let latest = tracker.job();
        let diff = latest.status.compare(change.status);
        let check_in = change.check_in.as_deref().unwrap_or_default();
        if diff > 0 || (diff == 0 && latest.check_in != check_in) {
            self.events_tx
                .send(event)
                .await
                .map_err(|_| JobServiceError::Internal("hook agent is stopped".into()))?;
            return Ok(ResendOutcome::Resubmitted);
        }
        debug!(
            message = %event.message,
            latest = %latest.status,
            "Outdated hook event, dropping"
        );
        Ok(ResendOutcome::Dropped)
    }
}

#[async_trait]
impl HookCallback for HookAgent {
    async fn on_status_change(&self, hook_url: &str, change: StatusChange) -> Result<()> {
        self.trigger(Event::for_change(hook_url, change, self.clock.unix()))
            .await
    }
}
