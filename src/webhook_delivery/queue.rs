//! Durable per-endpoint delivery queues.
//!
//! A delivery leaves its queue only once it reaches a terminal outcome
//! (`delivered` or `failed_terminal`), which is what gives the engine its
//! at-least-once guarantee across restarts. Queues are bounded; overflow
//! drops the oldest pending delivery with a logged warning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

use checkout_types::event::EventEnvelope;
use checkout_types::id::{DeliveryId, EndpointId};

/// Maximum deliveries queued per endpoint before the oldest is dropped.
pub const ENDPOINT_BACKLOG_BOUND: usize = 1024;

/// One `(event, endpoint)` delivery, queued until terminally resolved.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub delivery_id: DeliveryId,
    pub endpoint_id: EndpointId,
    pub event: EventEnvelope,
    /// The next attempt's 1-based ordinal.
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}

impl QueuedDelivery {
    pub fn new(endpoint_id: EndpointId, event: EventEnvelope) -> Self {
        QueuedDelivery {
            delivery_id: DeliveryId::generate(),
            endpoint_id,
            event,
            attempt: 1,
            next_attempt_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryQueueError {
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Durable queue contract. One logical FIFO per endpoint.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, delivery: QueuedDelivery) -> Result<(), DeliveryQueueError>;

    /// The endpoint's head-of-line delivery, if any.
    async fn head(&self, endpoint_id: EndpointId)
    -> Result<Option<QueuedDelivery>, DeliveryQueueError>;

    /// Reschedules the head-of-line delivery (bumped attempt, new due time).
    async fn reschedule(&self, delivery: QueuedDelivery) -> Result<(), DeliveryQueueError>;

    /// Removes a terminally resolved delivery.
    async fn complete(
        &self,
        endpoint_id: EndpointId,
        delivery_id: DeliveryId,
    ) -> Result<(), DeliveryQueueError>;

    /// Endpoints with work pending, for restart resume.
    async fn endpoints_with_pending(&self) -> Result<Vec<EndpointId>, DeliveryQueueError>;

    async fn pending_count(&self, endpoint_id: EndpointId) -> Result<usize, DeliveryQueueError>;
}

/// In-memory reference queue.
#[derive(Default)]
pub struct InMemoryDeliveryQueue {
    queues: DashMap<EndpointId, VecDeque<QueuedDelivery>>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, delivery: QueuedDelivery) -> Result<(), DeliveryQueueError> {
        let mut queue = self.queues.entry(delivery.endpoint_id).or_default();
        if queue.len() >= ENDPOINT_BACKLOG_BOUND {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    endpoint_id = %dropped.endpoint_id,
                    delivery_id = %dropped.delivery_id,
                    event_type = %dropped.event.event_type,
                    "Endpoint backlog full; dropped oldest pending delivery"
                );
            }
        }
        queue.push_back(delivery);
        Ok(())
    }

    async fn head(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Option<QueuedDelivery>, DeliveryQueueError> {
        Ok(self
            .queues
            .get(&endpoint_id)
            .and_then(|queue| queue.front().cloned()))
    }

    async fn reschedule(&self, delivery: QueuedDelivery) -> Result<(), DeliveryQueueError> {
        if let Some(mut queue) = self.queues.get_mut(&delivery.endpoint_id) {
            if let Some(head) = queue.front_mut() {
                if head.delivery_id == delivery.delivery_id {
                    *head = delivery;
                }
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        endpoint_id: EndpointId,
        delivery_id: DeliveryId,
    ) -> Result<(), DeliveryQueueError> {
        if let Some(mut queue) = self.queues.get_mut(&endpoint_id) {
            queue.retain(|delivery| delivery.delivery_id != delivery_id);
        }
        Ok(())
    }

    async fn endpoints_with_pending(&self) -> Result<Vec<EndpointId>, DeliveryQueueError> {
        Ok(self
            .queues
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect())
    }

    async fn pending_count(&self, endpoint_id: EndpointId) -> Result<usize, DeliveryQueueError> {
        Ok(self
            .queues
            .get(&endpoint_id)
            .map(|queue| queue.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkout_types::event::{AggregateType, DomainEvent, EventMetadata, EventType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe;

    impl DomainEvent for Probe {
        fn event_type(&self) -> EventType {
            EventType::InvoicePaid
        }

        fn aggregate_type() -> AggregateType {
            AggregateType::Invoice
        }
    }

    fn delivery(endpoint_id: EndpointId) -> QueuedDelivery {
        let event = EventEnvelope::record(
            "inv-1",
            1,
            &Probe,
            EventMetadata::produced_by("test"),
        )
        .unwrap();
        QueuedDelivery::new(endpoint_id, event)
    }

    #[tokio::test]
    async fn test_fifo_per_endpoint() {
        let queue = InMemoryDeliveryQueue::new();
        let endpoint = EndpointId::generate();
        let first = delivery(endpoint);
        let second = delivery(endpoint);
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let head = queue.head(endpoint).await.unwrap().unwrap();
        assert_eq!(head.delivery_id, first.delivery_id);

        queue.complete(endpoint, first.delivery_id).await.unwrap();
        let head = queue.head(endpoint).await.unwrap().unwrap();
        assert_eq!(head.delivery_id, second.delivery_id);
    }

    #[tokio::test]
    async fn test_reschedule_updates_head_in_place() {
        let queue = InMemoryDeliveryQueue::new();
        let endpoint = EndpointId::generate();
        let mut queued = delivery(endpoint);
        queue.enqueue(queued.clone()).await.unwrap();

        queued.attempt = 2;
        queued.next_attempt_at = Utc::now() + chrono::Duration::seconds(30);
        queue.reschedule(queued.clone()).await.unwrap();

        let head = queue.head(endpoint).await.unwrap().unwrap();
        assert_eq!(head.attempt, 2);
        assert_eq!(head.delivery_id, queued.delivery_id);
        assert_eq!(queue.pending_count(endpoint).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backlog_bound_drops_oldest() {
        let queue = InMemoryDeliveryQueue::new();
        let endpoint = EndpointId::generate();
        let first = delivery(endpoint);
        queue.enqueue(first.clone()).await.unwrap();
        for _ in 0..ENDPOINT_BACKLOG_BOUND {
            queue.enqueue(delivery(endpoint)).await.unwrap();
        }
        assert_eq!(
            queue.pending_count(endpoint).await.unwrap(),
            ENDPOINT_BACKLOG_BOUND
        );
        let head = queue.head(endpoint).await.unwrap().unwrap();
        assert_ne!(head.delivery_id, first.delivery_id);
    }

    #[tokio::test]
    async fn test_endpoints_with_pending_for_resume() {
        let queue = InMemoryDeliveryQueue::new();
        let busy = EndpointId::generate();
        let drained = EndpointId::generate();
        let done = delivery(drained);
        queue.enqueue(delivery(busy)).await.unwrap();
        queue.enqueue(done.clone()).await.unwrap();
        queue.complete(drained, done.delivery_id).await.unwrap();

        let pending = queue.endpoints_with_pending().await.unwrap();
        assert_eq!(pending, vec![busy]);
    }
}
