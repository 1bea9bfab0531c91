//! Post-commit delivery of public events.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::Event;

/// Error reported by a publisher transport.
#[derive(Debug, Error)]
#[error("Publish failed: {message}")]
pub struct PublishError {
    pub message: String,
}

impl PublishError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A public event paired with the routing key it is published under.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishEntry {
    pub event: Event,
    pub routing_key: String,
}

impl PublishEntry {
    /// Routes the event under its own name.
    pub fn for_event(event: Event) -> Self {
        let routing_key = event.event_name().to_string();
        Self { event, routing_key }
    }
}

/// Delivers committed public events to consumers outside the store.
///
/// Only events whose unit of work has already committed are handed over.
/// Retries and delivery guarantees belong to the implementation; the store
/// never rolls back or retries an append because publishing failed.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes a single event.
    async fn publish(&self, event: &Event, routing_key: &str) -> Result<(), PublishError>;

    /// Publishes an ordered batch of events.
    async fn publish_batch(&self, entries: &[PublishEntry]) -> Result<(), PublishError> {
        for entry in entries {
            self.publish(&entry.event, &entry.routing_key).await?;
        }
        Ok(())
    }
}

/// Publishes the public subset of a committed batch, in original order.
///
/// Failures are logged and counted, never returned.
pub(crate) async fn publish_committed(publisher: Option<&Arc<dyn EventPublisher>>, events: &[Event]) {
    let Some(publisher) = publisher else {
        return;
    };

    let entries: Vec<PublishEntry> = events
        .iter()
        .filter(|event| event.is_public())
        .cloned()
        .map(PublishEntry::for_event)
        .collect();

    if entries.is_empty() {
        return;
    }

    match publisher.publish_batch(&entries).await {
        Ok(()) => {
            metrics::counter!("event_store_events_published_total").increment(entries.len() as u64);
        }
        Err(error) => {
            metrics::counter!("event_store_publish_failures_total").increment(1);
            tracing::warn!(%error, batch_size = entries.len(), "failed to publish committed events");
        }
    }
}

/// Publisher that keeps every delivered batch in memory.
///
/// Useful in tests to observe what was published and when. It can be
/// switched into a failing mode to exercise delivery errors.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    batches: Arc<RwLock<Vec<Vec<PublishEntry>>>>,
    failure: Arc<RwLock<Option<String>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent delivery fail with the given message.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }

    /// Restores successful delivery.
    pub async fn recover(&self) {
        *self.failure.write().await = None;
    }

    /// Returns all delivered batches in delivery order.
    pub async fn batches(&self) -> Vec<Vec<PublishEntry>> {
        self.batches.read().await.clone()
    }

    /// Returns every delivered entry, flattened.
    pub async fn entries(&self) -> Vec<PublishEntry> {
        self.batches.read().await.iter().flatten().cloned().collect()
    }

    async fn deliver(&self, entries: Vec<PublishEntry>) -> Result<(), PublishError> {
        if let Some(message) = self.failure.read().await.clone() {
            return Err(PublishError::new(message));
        }
        self.batches.write().await.push(entries);
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &Event, routing_key: &str) -> Result<(), PublishError> {
        self.deliver(vec![PublishEntry {
            event: event.clone(),
            routing_key: routing_key.to_string(),
        }])
        .await
    }

    async fn publish_batch(&self, entries: &[PublishEntry]) -> Result<(), PublishError> {
        self.deliver(entries.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AggregateId, Visibility};

    fn event(name: &str, visibility: Visibility) -> Event {
        Event::new(
            AggregateId::new("a-1"),
            name,
            serde_json::json!({}),
            visibility,
        )
    }

    #[tokio::test]
    async fn publishes_only_public_events_in_order() {
        let publisher = InMemoryPublisher::new();
        let shared: Arc<dyn EventPublisher> = Arc::new(publisher.clone());

        let events = vec![
            event("First", Visibility::Public),
            event("Hidden", Visibility::Private),
            event("Second", Visibility::Public),
        ];
        publish_committed(Some(&shared), &events).await;

        let batches = publisher.batches().await;
        assert_eq!(batches.len(), 1);
        let keys: Vec<_> = batches[0].iter().map(|e| e.routing_key.as_str()).collect();
        assert_eq!(keys, vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn skips_batches_without_public_events() {
        let publisher = InMemoryPublisher::new();
        let shared: Arc<dyn EventPublisher> = Arc::new(publisher.clone());

        publish_committed(Some(&shared), &[event("Hidden", Visibility::Private)]).await;

        assert!(publisher.batches().await.is_empty());
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_with("broker down").await;
        let shared: Arc<dyn EventPublisher> = Arc::new(publisher.clone());

        publish_committed(Some(&shared), &[event("First", Visibility::Public)]).await;
        assert!(publisher.entries().await.is_empty());

        publisher.recover().await;
        publish_committed(Some(&shared), &[event("First", Visibility::Public)]).await;
        assert_eq!(publisher.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn single_publish_uses_given_routing_key() {
        let publisher = InMemoryPublisher::new();
        publisher
            .publish(&event("First", Visibility::Public), "custom.key")
            .await
            .unwrap();

        let entries = publisher.entries().await;
        assert_eq!(entries[0].routing_key, "custom.key");
    }
}
