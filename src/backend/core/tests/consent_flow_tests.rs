//! End-to-end consent flow on a single node.
//!
//! The node manages both custodian and actor; bridge events are fed back
//! into the node the way the bridge would deliver them.

mod common;

use std::sync::Arc;

use common::*;
use consent_core::aggregates::{negotiation_id, ConsentStatus, NegotiationState};
use consent_core::consent_store::ConsentStore;
use consent_core::events::{DomainEvent, EventStore, StreamId};
use consent_core::registry::InMemoryRegistry;
use consent_core::sync::state::{decode_payload, FullConsentRequestState};
use consent_core::sync::{BridgeEvent, Channel, EventName};

// ============================================================================
// Test Utilities
// ============================================================================

/// One signing round: receive, validate, acknowledge, sign.
async fn sign_round(node: &Node, state: &BridgeEvent) -> BridgeEvent {
    let valid = node
        .deliver(state.renamed(EventName::DistributedRequestReceived))
        .await
        .expect("request-valid");
    assert_eq!(valid.name, EventName::RequestValid);

    let acked = node.deliver(valid).await.expect("request-acked");
    assert_eq!(acked.name, EventName::RequestAcked);

    let signed = node.deliver(acked).await.expect("attachment-signed");
    assert_eq!(signed.name, EventName::AttachmentSigned);
    signed
}

fn signers(event: &BridgeEvent) -> Vec<String> {
    let state: FullConsentRequestState = decode_payload(&event.payload).unwrap();
    state.consent_records[0]
        .signatures()
        .iter()
        .map(|s| s.legal_entity.clone())
        .collect()
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_proposes_negotiation() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    let id = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    let consent = node.consent(id).await;
    assert_eq!(consent.status(), ConsentStatus::Pending);
    assert!(consent.is_unique());
    assert!(consent.is_custodian_checked());

    let published = node.bridge.published();
    assert_eq!(published.len(), 1);
    let (channel, event) = &published[0];
    assert_eq!(*channel, Channel::ConsentRequest);
    assert_eq!(event.name, EventName::RequestConstructed);
    assert_eq!(event.initiator_legal_entity, CUSTODIAN);
    assert!(!event.external_id.is_empty());

    let negotiation = uuid::Uuid::parse_str(&event.uuid).unwrap();
    let history = node.event_store.load(&StreamId::negotiation(negotiation)).await.unwrap();
    assert!(history
        .iter()
        .any(|e| matches!(e.event, DomainEvent::ConsentProposed { .. })));
}

#[tokio::test]
async fn test_unmanaged_custodian_rejected() {
    // The custodian is a known party whose keys live on another node.
    let registry = Arc::new(InMemoryRegistry::new());
    let _custodian_node = node_with_registry("node-b", &[CUSTODIAN], registry.clone());
    let node = node_with_registry("node-a", &[ACTOR], registry);
    let id = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    let consent = node.consent(id).await;
    assert_eq!(consent.status(), ConsentStatus::Errored);
    assert!(consent.is_custodian_checked());
    assert_eq!(consent.reason(), Some("Custodian is not managed by this node"));
    assert!(node.bridge.published().is_empty());
}

#[tokio::test]
async fn test_unknown_custodian_errored_before_reservation() {
    let node = node("node-a", &[ACTOR]);
    let id = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    let consent = node.consent(id).await;
    assert_eq!(consent.status(), ConsentStatus::Errored);
    assert!(!consent.is_custodian_checked());
    assert_eq!(consent.reason(), Some("custodian is not a valid or known party"));
    assert!(node.bridge.published().is_empty());
}

#[tokio::test]
async fn test_duplicate_triple_canceled() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    let first = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let second = node.service.register_consent(consent_data(SOCIAL)).await.unwrap();

    assert_eq!(node.consent_status(first).await, ConsentStatus::Pending);
    assert_eq!(node.consent_status(second).await, ConsentStatus::Canceled);
    assert_eq!(
        node.consent(second).await.reason(),
        Some("a consent request for this custodian, subject and actor already exists")
    );

    // Only the first request reaches the bridge.
    let published = node.bridge.published();
    assert_eq!(published.len(), 1);
    let (_, constructed) = &published[0];
    assert_eq!(constructed.name, EventName::RequestConstructed);
    let state: FullConsentRequestState = decode_payload(&constructed.payload).unwrap();
    assert_eq!(state.consent_records.len(), 1);

    let negotiation = uuid::Uuid::parse_str(&constructed.uuid).unwrap();
    let history = node.event_store.load(&StreamId::negotiation(negotiation)).await.unwrap();
    let added = history
        .iter()
        .filter(|e| matches!(e.event, DomainEvent::ConsentAdded { .. }))
        .count();
    assert_eq!(added, 1);
}

#[tokio::test]
async fn test_uniqueness_survives_restart() {
    let before = node("node-a", &[CUSTODIAN, ACTOR]);
    before.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    let after = restart(
        "node-a",
        before.crypto.clone(),
        before.registry.clone(),
        before.event_store.clone(),
    );
    assert_eq!(after.service.rebuild_projections().await.unwrap(), 1);

    let duplicate = after.service.register_consent(consent_data(SOCIAL)).await.unwrap();
    assert_eq!(after.consent_status(duplicate).await, ConsentStatus::Canceled);
}

// ============================================================================
// Signing & Distribution
// ============================================================================

#[tokio::test]
async fn test_full_flow_completes_consent() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    let id = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let constructed = node.take(EventName::RequestConstructed);
    let negotiation = uuid::Uuid::parse_str(&constructed.uuid).unwrap();

    // Actor is listed first and signs first.
    let first = sign_round(&node, &constructed).await;
    assert_eq!(signers(&first), vec![ACTOR.to_string()]);

    let second = sign_round(&node, &first).await;
    assert_eq!(signers(&second), vec![ACTOR.to_string(), CUSTODIAN.to_string()]);

    let present = node
        .deliver(second.renamed(EventName::DistributedRequestReceived))
        .await
        .expect("all-signatures-present");
    assert_eq!(present.name, EventName::AllSignaturesPresent);

    let completed = node
        .deliver(present.renamed(EventName::ConsentDistributed))
        .await
        .expect("completed");
    assert_eq!(completed.name, EventName::Completed);

    let stored = node.consent_store.find(&constructed.external_id).await.unwrap().unwrap();
    assert_eq!(stored.custodian, CUSTODIAN);
    assert_eq!(stored.actor, ACTOR);
    assert_eq!(stored.records.len(), 1);
    assert_eq!(stored.records[0].data_classes, vec![MEDICAL.to_string()]);

    assert_eq!(node.consent_status(id).await, ConsentStatus::Completed);

    let history = node.event_store.load(&StreamId::negotiation(negotiation)).await.unwrap();
    let mirrored = history
        .iter()
        .filter(|e| matches!(e.event, DomainEvent::SignatureAdded { .. }))
        .count();
    assert_eq!(mirrored, 2);
    assert!(history
        .iter()
        .any(|e| matches!(e.event, DomainEvent::NegotiationAllSigned { .. })));
}

#[tokio::test]
async fn test_negotiation_identifiers_are_stable() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    node.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let constructed = node.take(EventName::RequestConstructed);

    let relation = consent_core::aggregates::treatment_relation_id(
        &hex::decode(&constructed.external_id).unwrap(),
    );
    assert_eq!(constructed.uuid, negotiation_id(relation).to_string());
}

#[tokio::test]
async fn test_bridge_error_marks_negotiation_errored() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    node.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let constructed = node.take(EventName::RequestConstructed);
    let negotiation = uuid::Uuid::parse_str(&constructed.uuid).unwrap();

    node.service
        .handle_bridge_event(&constructed.errored("bridge rejected the request"))
        .await
        .unwrap();

    let history = node.event_store.load(&StreamId::negotiation(negotiation)).await.unwrap();
    let last = history.last().unwrap();
    assert!(matches!(
        &last.event,
        DomainEvent::NegotiationStateUpdated {
            state: NegotiationState::Errored { reason }
        } if reason == "bridge rejected the request"
    ));
}

#[tokio::test]
async fn test_unavailable_bridge_leaves_consent_pending() {
    let node = node("node-a", &[CUSTODIAN, ACTOR]);
    node.bridge.set_available(false);
    let mut failures = node.service.bus().subscribe_errors();

    let id = node.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    assert_eq!(node.consent_status(id).await, ConsentStatus::Pending);
    assert!(node.bridge.published().is_empty());
    assert!(failures.try_recv().is_ok());
}
