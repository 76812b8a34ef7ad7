//! Topic-partitioned event publication with outbox reconciliation.
//!
//! Events are published to the streaming bus only after the log has accepted
//! them. A failed publish never fails the caller: the log is the source of
//! truth and the outbox sweep re-publishes from it until the per-aggregate
//! `published_through_version` cursor catches up. Publishing is at-least-once
//! and keyed by `aggregate_id`, so one aggregate's events land on one
//! partition in order; consumers must tolerate duplicates.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

use checkout_types::event::{EventEnvelope, EventType};

use crate::event_store::{EventStore, EventStoreError};

/// Default topic for domain aggregates.
pub const TOPIC_DOMAIN_EVENTS: &str = "domain-events";
/// Topic for delivery-engine operational events.
pub const TOPIC_INTEGRATIONS: &str = "integrations";

#[derive(Debug, thiserror::Error)]
#[error("Publish to {topic} failed: {reason}")]
pub struct EventBusError {
    pub topic: String,
    pub reason: String,
}

/// A streaming bus producer. Partitioning is by `key` (always the
/// aggregate id here).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &EventEnvelope,
    ) -> Result<(), EventBusError>;
}

/// A component fed every committed event, such as the webhook router.
///
/// Consumers run after the commit; they receive an aggregate's events in
/// stream order and may see duplicates after crash recovery.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn on_event(&self, event: &EventEnvelope);
}

/// Routes each event type to a bus topic.
///
/// Resolution order: exact event-type entry, then family prefix (the segment
/// before the dot), then the default topic.
#[derive(Debug, Clone)]
pub struct TopicMap {
    exact: HashMap<String, String>,
    by_family: HashMap<String, String>,
    default_topic: String,
}

impl TopicMap {
    /// The built-in mapping: everything lands on `domain-events` except
    /// `webhook_delivery.*`, which goes to `integrations`.
    pub fn standard() -> Self {
        let mut by_family = HashMap::new();
        by_family.insert("webhook_delivery".to_string(), TOPIC_INTEGRATIONS.to_string());
        TopicMap {
            exact: HashMap::new(),
            by_family,
            default_topic: TOPIC_DOMAIN_EVENTS.to_string(),
        }
    }

    /// Applies configuration overrides. Keys are either full event types
    /// (`invoice.paid`) or family prefixes (`invoice`).
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for (key, topic) in overrides {
            if key.contains('.') {
                self.exact.insert(key.clone(), topic.clone());
            } else {
                self.by_family.insert(key.clone(), topic.clone());
            }
        }
        self
    }

    pub fn route(&self, event_type: EventType) -> &str {
        let wire = event_type.as_str();
        if let Some(topic) = self.exact.get(wire) {
            return topic;
        }
        let family = wire.split('.').next().unwrap_or(wire);
        self.by_family
            .get(family)
            .unwrap_or(&self.default_topic)
    }
}

/// In-memory bus: retains published records per topic, with optional
/// failure injection for exercising the outbox path.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: DashMap<String, Vec<(String, EventEnvelope)>>,
    fail_publishes: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self, topic: &str) -> Vec<(String, EventEnvelope)> {
        self.topics
            .get(topic)
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &EventEnvelope,
    ) -> Result<(), EventBusError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(EventBusError {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((key.to_string(), event.clone()));
        Ok(())
    }
}

/// The append-then-publish seam every service writes through.
///
/// `append_and_publish` commits to the log, then best-effort publishes to
/// the bus and feeds registered consumers. The publication cursor advances
/// only past events the bus accepted, leaving the rest to
/// [`EventPublisher::reconcile_outbox`].
pub struct EventPublisher {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventBus>,
    topics: TopicMap,
    consumers: Vec<Arc<dyn EventConsumer>>,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn EventStore>, bus: Arc<dyn EventBus>, topics: TopicMap) -> Self {
        EventPublisher {
            store,
            bus,
            topics,
            consumers: Vec::new(),
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Appends to the log; the events are committed once this returns `Ok`.
    /// Bus publication failures are logged and left to the outbox sweep.
    #[instrument(skip_all, fields(count = events.len()))]
    pub async fn append_and_publish(
        &self,
        events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let committed = self.store.append(events).await?;
        self.publish_committed(&committed).await;
        for event in &committed {
            for consumer in &self.consumers {
                consumer.on_event(event).await;
            }
        }
        Ok(committed)
    }

    async fn publish_committed(&self, events: &[EventEnvelope]) {
        for event in events {
            let topic = self.topics.route(event.event_type);
            match self.bus.publish(topic, &event.aggregate_id, event).await {
                Ok(()) => {
                    if let Err(error) = self
                        .store
                        .mark_published(&event.aggregate_id, event.event_version)
                        .await
                    {
                        tracing::warn!(
                            aggregate_id = %event.aggregate_id,
                            error = %error,
                            "Failed to advance publication cursor"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        aggregate_id = %event.aggregate_id,
                        event_type = %event.event_type,
                        error = %error,
                        "Bus publish failed; event left for outbox sweep"
                    );
                    // Stop here to preserve per-aggregate publish order.
                    break;
                }
            }
        }
    }

    /// One outbox sweep pass: re-publishes lagging streams from the log.
    /// Returns how many events were published.
    #[instrument(skip_all)]
    pub async fn reconcile_outbox(&self, batch: usize) -> Result<usize, EventStoreError> {
        let mut published_count = 0;
        for aggregate_id in self.store.unpublished_aggregates(batch).await? {
            let cursor = self.store.published_through(&aggregate_id).await?;
            let pending = self.store.load(&aggregate_id, cursor + 1).await?;
            for event in &pending {
                let topic = self.topics.route(event.event_type);
                match self.bus.publish(topic, &event.aggregate_id, event).await {
                    Ok(()) => {
                        self.store
                            .mark_published(&aggregate_id, event.event_version)
                            .await?;
                        published_count += 1;
                    }
                    Err(error) => {
                        tracing::warn!(
                            aggregate_id = %aggregate_id,
                            error = %error,
                            "Outbox sweep publish failed; will retry next pass"
                        );
                        break;
                    }
                }
            }
        }
        Ok(published_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use checkout_types::event::{AggregateType, DomainEvent, EventMetadata};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        n: u32,
    }

    impl DomainEvent for Probe {
        fn event_type(&self) -> EventType {
            EventType::InvoicePaid
        }

        fn aggregate_type() -> AggregateType {
            AggregateType::Invoice
        }
    }

    fn envelope(aggregate_id: &str, version: u64) -> EventEnvelope {
        EventEnvelope::record(
            aggregate_id,
            version,
            &Probe { n: version as u32 },
            EventMetadata::produced_by("test"),
        )
        .unwrap()
    }

    fn publisher(
        store: Arc<InMemoryEventStore>,
        bus: Arc<InMemoryEventBus>,
    ) -> EventPublisher {
        EventPublisher::new(store, bus, TopicMap::standard())
    }

    #[test]
    fn test_topic_map_standard_routes() {
        let topics = TopicMap::standard();
        assert_eq!(topics.route(EventType::InvoicePaid), TOPIC_DOMAIN_EVENTS);
        assert_eq!(topics.route(EventType::PaymentConfirmed), TOPIC_DOMAIN_EVENTS);
        assert_eq!(topics.route(EventType::SettlementCompleted), TOPIC_DOMAIN_EVENTS);
        assert_eq!(
            topics.route(EventType::WebhookDeliveryAttempted),
            TOPIC_INTEGRATIONS
        );
    }

    #[test]
    fn test_topic_map_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("invoice.paid".to_string(), "hot-path".to_string());
        overrides.insert("payment".to_string(), "payments".to_string());
        let topics = TopicMap::standard().with_overrides(&overrides);
        assert_eq!(topics.route(EventType::InvoicePaid), "hot-path");
        assert_eq!(topics.route(EventType::InvoiceExpired), TOPIC_DOMAIN_EVENTS);
        assert_eq!(topics.route(EventType::PaymentDetected), "payments");
    }

    #[tokio::test]
    async fn test_publish_after_append_advances_cursor() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(store.clone(), bus.clone());

        publisher
            .append_and_publish(vec![envelope("inv-1", 1), envelope("inv-1", 2)])
            .await
            .unwrap();

        let records = bus.published(TOPIC_DOMAIN_EVENTS);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(key, _)| key == "inv-1"));
        assert_eq!(store.published_through("inv-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_fail_caller() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(store.clone(), bus.clone());

        bus.set_failing(true);
        publisher
            .append_and_publish(vec![envelope("inv-1", 1)])
            .await
            .unwrap();

        // Committed to the log, but the cursor is stuck at zero.
        assert_eq!(store.current_version("inv-1").await.unwrap(), 1);
        assert_eq!(store.published_through("inv-1").await.unwrap(), 0);
        assert!(bus.published(TOPIC_DOMAIN_EVENTS).is_empty());
    }

    #[tokio::test]
    async fn test_outbox_sweep_catches_up() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = publisher(store.clone(), bus.clone());

        bus.set_failing(true);
        publisher
            .append_and_publish(vec![envelope("inv-1", 1), envelope("inv-1", 2)])
            .await
            .unwrap();
        assert_eq!(publisher.reconcile_outbox(16).await.unwrap(), 0);

        bus.set_failing(false);
        let published = publisher.reconcile_outbox(16).await.unwrap();
        assert_eq!(published, 2);
        assert_eq!(store.published_through("inv-1").await.unwrap(), 2);

        let records = bus.published(TOPIC_DOMAIN_EVENTS);
        let versions: Vec<u64> = records.iter().map(|(_, e)| e.event_version).collect();
        assert_eq!(versions, vec![1, 2]);

        // Nothing left to sweep.
        assert_eq!(publisher.reconcile_outbox(16).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consumers_see_committed_events() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl EventConsumer for Counting {
            async fn on_event(&self, _event: &EventEnvelope) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let consumer = Arc::new(Counting(AtomicUsize::new(0)));
        let publisher =
            publisher(store.clone(), bus.clone()).with_consumer(consumer.clone());

        publisher
            .append_and_publish(vec![envelope("inv-1", 1)])
            .await
            .unwrap();
        assert_eq!(consumer.0.load(Ordering::SeqCst), 1);

        // A rejected append feeds no consumers.
        let _ = publisher.append_and_publish(vec![envelope("inv-1", 5)]).await;
        assert_eq!(consumer.0.load(Ordering::SeqCst), 1);
    }
}
