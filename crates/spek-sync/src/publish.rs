//! At-least-once event channel for "new listing" events.
//!
//! A [`Topic`] fans every published event out to its subscriptions. Each
//! subscription drains its own queue on a worker task and retries a failing
//! handler with capped exponential backoff, so a handler may see the same
//! event more than once and must tolerate that.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spek_core::NewListingEvent;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const NEW_LISTINGS_TOPIC: &str = "new-advertisements";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("topic {0} has no live subscriptions")]
    Closed(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &NewListingEvent) -> Result<(), PublishError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &NewListingEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug)]
struct Subscription {
    name: String,
    tx: mpsc::UnboundedSender<NewListingEvent>,
}

#[derive(Debug)]
pub struct Topic {
    name: String,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a worker delivering every subsequently published event to
    /// `handler`. The worker exits once the topic is closed and its queue drained.
    pub async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler>,
        retry: BackoffPolicy,
    ) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NewListingEvent>();
        let name = handler.name().to_string();
        self.subscriptions.lock().await.push(Subscription {
            name: name.clone(),
            tx,
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(handler.as_ref(), &event, retry).await;
            }
            debug!(subscription = %name, "subscription drained");
        })
    }

    /// Drops every subscription sender so workers finish their queues and exit.
    pub async fn close(&self) {
        self.subscriptions.lock().await.clear();
    }
}

#[async_trait]
impl EventPublisher for Topic {
    async fn publish(&self, event: &NewListingEvent) -> Result<(), PublishError> {
        let subscriptions = self.subscriptions.lock().await;
        if subscriptions.is_empty() {
            debug!(topic = %self.name, event_id = %event.event_id, "no subscriptions; event dropped");
            return Ok(());
        }

        let mut delivered = 0usize;
        for sub in subscriptions.iter() {
            match sub.tx.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(topic = %self.name, subscription = %sub.name, "subscription worker gone"),
            }
        }

        if delivered == 0 {
            return Err(PublishError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

async fn deliver(handler: &dyn EventHandler, event: &NewListingEvent, retry: BackoffPolicy) {
    for attempt in 0..=retry.max_retries {
        match handler.handle(event).await {
            Ok(()) => return,
            Err(err) if attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    handler = handler.name(),
                    event_id = %event.event_id,
                    attempt,
                    error = %err,
                    "event handler failed; retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    handler = handler.name(),
                    event_id = %event.event_id,
                    query_id = %event.query_id,
                    listing_id = %event.listing.id,
                    error = %err,
                    "event handler gave up"
                );
            }
        }
    }
}
