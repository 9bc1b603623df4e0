//! Append-only event log with optimistic concurrency per stream.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::instrument;

use crate::error::{ConsentError, ErrorCode, Result};

use super::event::{EventEnvelope, StreamId};

/// Storage contract for the event log.
///
/// `append` fails with a concurrency conflict when the stream's current version
/// differs from `expected_version`. A successful append is visible to `load`
/// atomically: readers see either none or all of the batch.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch whose versions continue from `expected_version`.
    async fn append(
        &self,
        stream: &StreamId,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<()>;

    /// All events of one stream, in commit order.
    async fn load(&self, stream: &StreamId) -> Result<Vec<EventEnvelope>>;

    /// Every committed event across all streams, in commit order.
    async fn load_all(&self) -> Result<Vec<EventEnvelope>>;
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<StreamId, Vec<EventEnvelope>>,
    log: Vec<EventEnvelope>,
}

/// Process-local event log.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: RwLock<StoreState>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events across all streams.
    pub fn len(&self) -> usize {
        self.state.read().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, events), fields(stream = %stream, count = events.len()))]
    async fn append(
        &self,
        stream: &StreamId,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<()> {
        for (offset, envelope) in events.iter().enumerate() {
            if envelope.stream_id() != *stream
                || envelope.version() != expected_version + offset as u64 + 1
            {
                return Err(ConsentError::with_internal(
                    ErrorCode::InvalidEventData,
                    "event batch does not continue the stream",
                    format!(
                        "event {} at version {} on {}",
                        envelope.id(),
                        envelope.version(),
                        envelope.stream_id()
                    ),
                ));
            }
        }

        let mut state = self.state.write();
        let current = state.streams.get(stream).map_or(0, |s| s.len() as u64);
        if current != expected_version {
            return Err(ConsentError::concurrency_conflict(
                stream,
                expected_version,
                current,
            ));
        }

        state.log.extend(events.iter().cloned());
        state.streams.entry(*stream).or_default().extend(events);

        tracing::debug!(version = current, "Events appended");
        Ok(())
    }

    async fn load(&self, stream: &StreamId) -> Result<Vec<EventEnvelope>> {
        Ok(self
            .state
            .read()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default())
    }

    async fn load_all(&self) -> Result<Vec<EventEnvelope>> {
        Ok(self.state.read().log.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::DomainEvent;
    use std::sync::Arc;
    use uuid::Uuid;
    use tokio_test::{assert_err, assert_ok};

    fn batch(stream: StreamId, from: u64, count: u64) -> Vec<EventEnvelope> {
        (1..=count)
            .map(|i| EventEnvelope::new(DomainEvent::ConsentCompleted, stream, from + i))
            .collect()
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::consent(Uuid::new_v4());

        store.append(&stream, 0, batch(stream, 0, 2)).await.unwrap();
        store.append(&stream, 2, batch(stream, 2, 1)).await.unwrap();

        let events = store.load(&stream).await.unwrap();
        let versions: Vec<u64> = events.iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_load_unknown_stream_is_empty() {
        let store = InMemoryEventStore::new();
        let events = store.load(&StreamId::negotiation(Uuid::new_v4())).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::consent(Uuid::new_v4());
        assert_ok!(store.append(&stream, 0, batch(stream, 0, 1)).await);

        let err = assert_err!(store.append(&stream, 0, batch(stream, 0, 1)).await);
        assert_eq!(err.code(), ErrorCode::ConcurrencyConflict);
        assert_eq!(store.load(&stream).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_single_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let stream = StreamId::consent(Uuid::new_v4());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.append(&stream, 0, batch(stream, 0, 1)).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.load(&stream).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_gapped_batch() {
        let store = InMemoryEventStore::new();
        let stream = StreamId::consent(Uuid::new_v4());
        let err = assert_err!(store.append(&stream, 0, batch(stream, 1, 1)).await);
        assert_eq!(err.code(), ErrorCode::InvalidEventData);
    }

    #[tokio::test]
    async fn test_load_all_preserves_commit_order() {
        let store = InMemoryEventStore::new();
        let a = StreamId::consent(Uuid::new_v4());
        let b = StreamId::negotiation(Uuid::new_v4());
        store.append(&a, 0, batch(a, 0, 1)).await.unwrap();
        store.append(&b, 0, batch(b, 0, 1)).await.unwrap();
        store.append(&a, 1, batch(a, 1, 1)).await.unwrap();

        let all = store.load_all().await.unwrap();
        let streams: Vec<StreamId> = all.iter().map(|e| e.stream_id()).collect();
        assert_eq!(streams, vec![a, b, a]);
    }
}
