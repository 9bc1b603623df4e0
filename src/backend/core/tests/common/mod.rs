//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use consent_core::aggregates::{Aggregate, ConsentAggregate, ConsentStatus};
use consent_core::config::Config;
use consent_core::consent_store::InMemoryConsentStore;
use consent_core::crypto::{CryptoProvider, LocalCryptoProvider};
use consent_core::events::{ConsentData, EventStore, InMemoryEventStore, StreamId};
use consent_core::facts::FhirConsentFactBuilder;
use consent_core::registry::InMemoryRegistry;
use consent_core::sagas::InMemoryUniquenessProjection;
use consent_core::service::{Collaborators, ConsentService};
use consent_core::sync::{BridgeEvent, EventName, InMemoryBridge};

pub const CUSTODIAN: &str = "urn:oid:2.16.840.1.113883.2.4.6.1:00000001";
pub const ACTOR: &str = "urn:oid:2.16.840.1.113883.2.4.6.1:00000002";
pub const SUBJECT: &str = "urn:oid:2.16.840.1.113883.2.4.6.3:999999990";
pub const MEDICAL: &str = "urn:oid:1.3.6.1.4.1.54851.1:MEDICAL";
pub const SOCIAL: &str = "urn:oid:1.3.6.1.4.1.54851.1:SOCIAL";

pub struct Node {
    pub config: Config,
    pub service: Arc<ConsentService>,
    pub crypto: Arc<LocalCryptoProvider>,
    pub registry: Arc<InMemoryRegistry>,
    pub bridge: Arc<InMemoryBridge>,
    pub consent_store: Arc<InMemoryConsentStore>,
    pub event_store: Arc<InMemoryEventStore>,
}

/// A node managing `managed`, with its own registry.
pub fn node(identity: &str, managed: &[&str]) -> Node {
    node_with_registry(identity, managed, Arc::new(InMemoryRegistry::new()))
}

/// A node managing `managed`, publishing its keys in `registry`.
pub fn node_with_registry(identity: &str, managed: &[&str], registry: Arc<InMemoryRegistry>) -> Node {
    let crypto = Arc::new(LocalCryptoProvider::new(1024));
    for entity in managed {
        crypto.generate_key_pair(entity).unwrap();
        registry.publish_key(
            entity,
            crypto.public_key_as_jwk(entity).unwrap(),
            Utc::now() - Duration::days(1),
        );
    }
    restart(identity, crypto, registry, Arc::new(InMemoryEventStore::new()))
}

/// A fresh service over existing key material and event log.
pub fn restart(
    identity: &str,
    crypto: Arc<LocalCryptoProvider>,
    registry: Arc<InMemoryRegistry>,
    event_store: Arc<InMemoryEventStore>,
) -> Node {
    let mut config = Config::default();
    config.node.identity = identity.to_string();

    let bridge = Arc::new(InMemoryBridge::new(identity));
    let consent_store = Arc::new(InMemoryConsentStore::new());
    let service = ConsentService::new(
        &config,
        Collaborators {
            event_store: event_store.clone(),
            crypto: crypto.clone(),
            registry: registry.clone(),
            publisher: bridge.clone(),
            consent_store: consent_store.clone(),
            fact_builder: Arc::new(FhirConsentFactBuilder::new()),
            uniqueness: Arc::new(InMemoryUniquenessProjection::new()),
        },
    )
    .unwrap();

    Node {
        config,
        service: Arc::new(service),
        crypto,
        registry,
        bridge,
        consent_store,
        event_store,
    }
}

pub fn consent_data(class: &str) -> ConsentData {
    ConsentData {
        id: Uuid::new_v4(),
        custodian_id: CUSTODIAN.into(),
        subject_id: SUBJECT.into(),
        actor_id: ACTOR.into(),
        class: class.into(),
        start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end: None,
        performer_id: None,
        proof: None,
    }
}

impl Node {
    /// Drain the bridge and return the last event named `name`.
    pub fn take(&self, name: EventName) -> BridgeEvent {
        let published = self.bridge.take();
        published
            .into_iter()
            .rev()
            .map(|(_, event)| event)
            .find(|event| event.name == name)
            .unwrap_or_else(|| panic!("no {name} event published"))
    }

    /// Deliver an event and return the last event published in reaction.
    pub async fn deliver(&self, event: BridgeEvent) -> Option<BridgeEvent> {
        self.service.handle_bridge_event(&event).await.unwrap();
        self.bridge.take().pop().map(|(_, event)| event)
    }

    pub async fn consent(&self, id: Uuid) -> ConsentAggregate {
        let mut consent = ConsentAggregate::new(id);
        consent.replay(&self.event_store.load(&StreamId::consent(id)).await.unwrap());
        consent
    }

    pub async fn consent_status(&self, id: Uuid) -> ConsentStatus {
        self.consent(id).await.status()
    }
}
