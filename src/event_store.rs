//! Append-only per-aggregate event log with optimistic concurrency.
//!
//! The log is the system's commit point: an aggregate's state change exists
//! once its events are appended here. Appends are gated on the expected next
//! version, so concurrent writers to one aggregate race on version and the
//! loser reloads and retries. Projection updates registered with the store
//! run under the same commit point as the append itself.
//!
//! [`InMemoryEventStore`] is the reference implementation; a SQL-backed store
//! implements the same trait against a table with a unique
//! `(aggregate_id, event_version)` index.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use checkout_types::event::{EventEnvelope, EventType};

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// The expected next version did not match the stream head. The caller
    /// reloads the aggregate and reapplies its intent.
    #[error(
        "Concurrency conflict on {aggregate_id}: stream is at version {actual}, append started at {attempted}"
    )]
    ConcurrencyConflict {
        aggregate_id: String,
        actual: u64,
        attempted: u64,
    },
    #[error("Event versions within one append must be contiguous")]
    NonContiguousVersions,
    #[error("Append requires at least one event")]
    EmptyAppend,
    #[error("All events in one append must target the same aggregate")]
    MixedAggregates,
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// A read-model update applied under the same commit point as an append.
pub trait Projection: Send + Sync {
    fn apply(&self, event: &EventEnvelope);
}

/// The durable, ordered event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to their aggregate's stream.
    ///
    /// Succeeds iff the lowest incoming `event_version` equals the stream's
    /// current max plus one and the incoming versions are contiguous.
    /// Returns the envelopes stamped with their global sequence numbers.
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Loads a stream in ascending version order, starting at `from_version`.
    async fn load(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Recent events of one type in ascending `occurred_at` order, for
    /// read-model rebuilds.
    async fn load_by_type(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// The stream's current max version; 0 for an unknown aggregate.
    async fn current_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError>;

    /// The monotonically advancing bus-publication cursor for an aggregate.
    async fn published_through(&self, aggregate_id: &str) -> Result<u64, EventStoreError>;

    /// Advances the publication cursor. Regressions are ignored.
    async fn mark_published(
        &self,
        aggregate_id: &str,
        through_version: u64,
    ) -> Result<(), EventStoreError>;

    /// Aggregates whose streams extend past their publication cursor, for
    /// the outbox sweep.
    async fn unpublished_aggregates(&self, limit: usize)
    -> Result<Vec<String>, EventStoreError>;
}

/// Concurrent in-memory event log.
///
/// Streams live in a sharded map; the per-entry lock makes the
/// version check, the append, and the projection updates one atomic step.
#[derive(Default)]
pub struct InMemoryEventStore {
    streams: DashMap<String, Vec<EventEnvelope>>,
    by_type: DashMap<EventType, Vec<EventEnvelope>>,
    published: DashMap<String, u64>,
    sequence: AtomicU64,
    projections: Vec<Arc<dyn Projection>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a projection that runs under the append commit point.
    pub fn with_projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    fn validate(events: &[EventEnvelope]) -> Result<&str, EventStoreError> {
        let first = events.first().ok_or(EventStoreError::EmptyAppend)?;
        let aggregate_id = first.aggregate_id.as_str();
        for (offset, event) in events.iter().enumerate() {
            if event.aggregate_id != aggregate_id {
                return Err(EventStoreError::MixedAggregates);
            }
            if event.event_version != first.event_version + offset as u64 {
                return Err(EventStoreError::NonContiguousVersions);
            }
        }
        Ok(aggregate_id)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        mut events: Vec<EventEnvelope>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let aggregate_id = Self::validate(&events)?.to_string();
        let mut stream = self.streams.entry(aggregate_id.clone()).or_default();
        let current = stream.len() as u64;
        let attempted = events[0].event_version;
        if attempted != current + 1 {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                actual: current,
                attempted,
            });
        }
        for event in events.iter_mut() {
            event.sequence_number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        }
        for event in &events {
            stream.push(event.clone());
            self.by_type
                .entry(event.event_type)
                .or_default()
                .push(event.clone());
            for projection in &self.projections {
                projection.apply(event);
            }
        }
        Ok(events)
    }

    async fn load(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let events = self
            .streams
            .get(aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.event_version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn load_by_type(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let mut events: Vec<EventEnvelope> = self
            .by_type
            .get(&event_type)
            .map(|entry| {
                let skip = entry.len().saturating_sub(limit);
                entry.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|event| event.occurred_at);
        Ok(events)
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        Ok(self
            .streams
            .get(aggregate_id)
            .map(|stream| stream.len() as u64)
            .unwrap_or(0))
    }

    async fn published_through(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        Ok(self
            .published
            .get(aggregate_id)
            .map(|cursor| *cursor)
            .unwrap_or(0))
    }

    async fn mark_published(
        &self,
        aggregate_id: &str,
        through_version: u64,
    ) -> Result<(), EventStoreError> {
        let mut cursor = self.published.entry(aggregate_id.to_string()).or_insert(0);
        if through_version > *cursor {
            *cursor = through_version;
        }
        Ok(())
    }

    async fn unpublished_aggregates(
        &self,
        limit: usize,
    ) -> Result<Vec<String>, EventStoreError> {
        let mut behind = Vec::new();
        for entry in self.streams.iter() {
            let published = self
                .published
                .get(entry.key())
                .map(|cursor| *cursor)
                .unwrap_or(0);
            if (entry.value().len() as u64) > published {
                behind.push(entry.key().clone());
                if behind.len() >= limit {
                    break;
                }
            }
        }
        Ok(behind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkout_types::event::{AggregateType, DomainEvent, EventMetadata};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Probe {
        n: u32,
    }

    impl DomainEvent for Probe {
        fn event_type(&self) -> EventType {
            EventType::InvoiceCreated
        }

        fn aggregate_type() -> AggregateType {
            AggregateType::Invoice
        }
    }

    fn envelope(aggregate_id: &str, version: u64, n: u32) -> EventEnvelope {
        EventEnvelope::record(
            aggregate_id,
            version,
            &Probe { n },
            EventMetadata::produced_by("test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_load_in_order() {
        let store = InMemoryEventStore::new();
        store
            .append(vec![envelope("inv-1", 1, 10), envelope("inv-1", 2, 20)])
            .await
            .unwrap();
        store.append(vec![envelope("inv-1", 3, 30)]).await.unwrap();

        let events = store.load("inv-1", 1).await.unwrap();
        assert_eq!(events.len(), 3);
        let versions: Vec<u64> = events.iter().map(|e| e.event_version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(events.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));

        let tail = store.load("inv-1", 3).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_version, 3);
    }

    #[tokio::test]
    async fn test_append_rejects_version_gap() {
        let store = InMemoryEventStore::new();
        store.append(vec![envelope("inv-1", 1, 1)]).await.unwrap();
        let err = store.append(vec![envelope("inv-1", 3, 3)]).await.unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::ConcurrencyConflict {
                actual: 1,
                attempted: 3,
                ..
            }
        ));
        assert_eq!(store.current_version("inv-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_version() {
        let store = InMemoryEventStore::new();
        store
            .append(vec![envelope("inv-1", 1, 1), envelope("inv-1", 2, 2)])
            .await
            .unwrap();
        // A writer that loaded at version 1 loses the race.
        let err = store.append(vec![envelope("inv-1", 2, 99)]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn test_append_rejects_non_contiguous_batch() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(vec![envelope("inv-1", 1, 1), envelope("inv-1", 3, 3)])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::NonContiguousVersions));
    }

    #[tokio::test]
    async fn test_append_rejects_mixed_aggregates() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(vec![envelope("inv-1", 1, 1), envelope("inv-2", 2, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::MixedAggregates));
    }

    #[tokio::test]
    async fn test_empty_append_rejected() {
        let store = InMemoryEventStore::new();
        assert!(matches!(
            store.append(Vec::new()).await.unwrap_err(),
            EventStoreError::EmptyAppend
        ));
    }

    #[tokio::test]
    async fn test_load_by_type_respects_limit() {
        let store = InMemoryEventStore::new();
        for i in 1..=5 {
            store
                .append(vec![envelope(&format!("inv-{i}"), 1, i)])
                .await
                .unwrap();
        }
        let events = store.load_by_type(EventType::InvoiceCreated, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));
    }

    #[tokio::test]
    async fn test_publication_cursor_is_monotonic() {
        let store = InMemoryEventStore::new();
        store.append(vec![envelope("inv-1", 1, 1)]).await.unwrap();
        assert_eq!(store.published_through("inv-1").await.unwrap(), 0);
        store.mark_published("inv-1", 1).await.unwrap();
        assert_eq!(store.published_through("inv-1").await.unwrap(), 1);
        // Regression is ignored.
        store.mark_published("inv-1", 0).await.unwrap();
        assert_eq!(store.published_through("inv-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unpublished_aggregates_tracks_lag() {
        let store = InMemoryEventStore::new();
        store.append(vec![envelope("inv-1", 1, 1)]).await.unwrap();
        store.append(vec![envelope("inv-2", 1, 1)]).await.unwrap();
        store.mark_published("inv-1", 1).await.unwrap();

        let behind = store.unpublished_aggregates(10).await.unwrap();
        assert_eq!(behind, vec!["inv-2".to_string()]);
    }

    #[tokio::test]
    async fn test_projection_runs_under_commit() {
        struct Counter(AtomicUsize);
        impl Projection for Counter {
            fn apply(&self, _event: &EventEnvelope) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let store = InMemoryEventStore::new().with_projection(counter.clone());
        store
            .append(vec![envelope("inv-1", 1, 1), envelope("inv-1", 2, 2)])
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        // A rejected append must not feed projections.
        let _ = store.append(vec![envelope("inv-1", 5, 5)]).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let store = Arc::new(InMemoryEventStore::new());
        store.append(vec![envelope("inv-1", 1, 1)]).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(vec![envelope("inv-1", 2, n)]).await.is_ok()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(store.current_version("inv-1").await.unwrap(), 2);
    }
}
