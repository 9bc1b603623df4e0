//! One consent request per custodian/subject/actor triple.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::Saga;
use crate::commands::{Command, CommandKind};
use crate::error::Result;
use crate::events::{ConsentData, DomainEvent, EventEnvelope, EventMatcher, EventStore, EventType};

const DUPLICATE: &str = "a consent request for this custodian, subject and actor already exists";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniquenessKey {
    pub custodian_id: String,
    pub subject_id: String,
    pub actor_id: String,
}

impl From<&ConsentData> for UniquenessKey {
    fn from(data: &ConsentData) -> Self {
        Self {
            custodian_id: data.custodian_id.clone(),
            subject_id: data.subject_id.clone(),
            actor_id: data.actor_id.clone(),
        }
    }
}

pub trait UniquenessProjection: Send + Sync {
    /// Record `consent_id` as owner of `key` unless the key is owned already.
    ///
    /// Returns the owner after the call. Check and record happen atomically.
    fn claim(&self, key: UniquenessKey, consent_id: Uuid) -> Uuid;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryUniquenessProjection {
    owners: DashMap<UniquenessKey, Uuid>,
}

impl InMemoryUniquenessProjection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UniquenessProjection for InMemoryUniquenessProjection {
    fn claim(&self, key: UniquenessKey, consent_id: Uuid) -> Uuid {
        *self.owners.entry(key).or_insert(consent_id)
    }

    fn len(&self) -> usize {
        self.owners.len()
    }
}

/// Marks the first request of a triple unique and cancels later ones.
pub struct UniquenessSaga {
    projection: Arc<dyn UniquenessProjection>,
}

impl UniquenessSaga {
    pub fn new(projection: Arc<dyn UniquenessProjection>) -> Self {
        Self { projection }
    }

    /// Replay every registration in the log into the projection.
    ///
    /// Returns the number of registrations seen.
    pub async fn rebuild_from(&self, store: &dyn EventStore) -> Result<usize> {
        let mut seen = 0;
        for envelope in store.load_all().await? {
            if let DomainEvent::ConsentRequestRegistered(data) = &envelope.event {
                self.projection.claim(UniquenessKey::from(data), data.id);
                seen += 1;
            }
        }
        tracing::info!(registrations = seen, keys = self.projection.len(), "Uniqueness projection rebuilt");
        Ok(seen)
    }
}

#[async_trait]
impl Saga for UniquenessSaga {
    fn name(&self) -> &str {
        "uniqueness"
    }

    fn matcher(&self) -> EventMatcher {
        EventMatcher::types([EventType::ConsentRequestRegistered])
    }

    async fn react(&self, envelope: &EventEnvelope) -> Result<Vec<Command>> {
        let DomainEvent::ConsentRequestRegistered(data) = &envelope.event else {
            return Ok(Vec::new());
        };

        let owner = self.projection.claim(UniquenessKey::from(data), data.id);
        if owner == data.id {
            return Ok(vec![Command::new(data.id, CommandKind::MarkAsUnique)]);
        }

        tracing::info!(consent_id = %data.id, existing = %owner, "Duplicate consent request");
        Ok(vec![Command::cancel(data.id, DUPLICATE)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InMemoryEventStore, StreamId};
    use chrono::{TimeZone, Utc};

    fn data() -> ConsentData {
        ConsentData {
            id: Uuid::new_v4(),
            custodian_id: "urn:oid:2.16.840.1.113883.2.4.6.1:00000001".into(),
            subject_id: "urn:oid:2.16.840.1.113883.2.4.6.3:999999990".into(),
            actor_id: "urn:oid:2.16.840.1.113883.2.4.6.1:00000002".into(),
            class: "urn:oid:1.3.6.1.4.1.54851.1:MEDICAL".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: None,
            performer_id: None,
            proof: None,
        }
    }

    fn registered(data: &ConsentData) -> EventEnvelope {
        EventEnvelope::new(
            DomainEvent::ConsentRequestRegistered(data.clone()),
            StreamId::consent(data.id),
            1,
        )
    }

    #[tokio::test]
    async fn test_first_unique_second_canceled() {
        let saga = UniquenessSaga::new(Arc::new(InMemoryUniquenessProjection::new()));
        let first = data();
        let second = ConsentData {
            id: Uuid::new_v4(),
            class: "urn:oid:1.3.6.1.4.1.54851.1:SOCIAL".into(),
            ..first.clone()
        };

        let commands = saga.react(&registered(&first)).await.unwrap();
        assert_eq!(commands, vec![Command::new(first.id, CommandKind::MarkAsUnique)]);

        let commands = saga.react(&registered(&second)).await.unwrap();
        assert_eq!(commands, vec![Command::cancel(second.id, DUPLICATE)]);

        // Redelivery for the owner stays unique.
        let commands = saga.react(&registered(&first)).await.unwrap();
        assert_eq!(commands[0].kind, CommandKind::MarkAsUnique);
    }

    #[tokio::test]
    async fn test_rebuild_from_log() {
        let store = InMemoryEventStore::new();
        let first = data();
        store
            .append(&StreamId::consent(first.id), 0, vec![registered(&first)])
            .await
            .unwrap();

        let projection = Arc::new(InMemoryUniquenessProjection::new());
        let saga = UniquenessSaga::new(projection.clone());
        assert_eq!(saga.rebuild_from(&store).await.unwrap(), 1);
        assert_eq!(projection.len(), 1);

        let duplicate = ConsentData {
            id: Uuid::new_v4(),
            ..first
        };
        let commands = saga.react(&registered(&duplicate)).await.unwrap();
        assert!(matches!(commands[0].kind, CommandKind::CancelConsent { .. }));
    }

    #[test]
    fn test_concurrent_claims_single_owner() {
        let projection = Arc::new(InMemoryUniquenessProjection::new());
        let key = UniquenessKey::from(&data());

        let owners: Vec<Uuid> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let projection = projection.clone();
                    let key = key.clone();
                    scope.spawn(move || projection.claim(key, Uuid::new_v4()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(owners.iter().all(|o| *o == owners[0]));
        assert_eq!(projection.len(), 1);
    }
}
