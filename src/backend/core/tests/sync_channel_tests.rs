//! Two nodes negotiating over a relayed bridge.
//!
//! Node A manages the custodian and initiates; node B manages the actor.
//! Both publish their keys in one shared registry. The relay strips the
//! initiator before handing an event to B, as the bridge does.

mod common;

use std::sync::Arc;

use common::*;
use consent_core::aggregates::ConsentStatus;
use consent_core::consent_store::ConsentStore;
use consent_core::crypto::CryptoProvider;
use consent_core::registry::InMemoryRegistry;
use consent_core::sync::state::{decode_payload, encode_payload, FullConsentRequestState};
use consent_core::sync::{BridgeEvent, Channel, EventName};

// ============================================================================
// Test Utilities
// ============================================================================

fn nodes() -> (Node, Node) {
    let registry = Arc::new(InMemoryRegistry::new());
    let a = node_with_registry("node-a", &[CUSTODIAN], registry.clone());
    let b = node_with_registry("node-b", &[ACTOR], registry);
    (a, b)
}

/// The event as seen by a node that did not initiate it.
fn relayed(event: &BridgeEvent, name: EventName) -> BridgeEvent {
    let mut event = event.renamed(name);
    event.initiator_legal_entity.clear();
    event
}

/// Validate, acknowledge and sign on one node.
async fn sign_on(node: &Node, event: BridgeEvent) -> BridgeEvent {
    let valid = node.deliver(event).await.expect("request-valid");
    assert_eq!(valid.name, EventName::RequestValid);
    let acked = node.deliver(valid).await.expect("request-acked");
    node.deliver(acked).await.expect("attachment-signed")
}

/// Run the negotiation until every party has signed; returns the final state as A sees it.
async fn fully_signed(a: &Node, b: &Node) -> BridgeEvent {
    let constructed = a.take(EventName::RequestConstructed);

    let by_custodian = sign_on(a, constructed.renamed(EventName::DistributedRequestReceived)).await;
    assert_eq!(by_custodian.name, EventName::AttachmentSigned);

    let mut by_both = sign_on(b, relayed(&by_custodian, EventName::DistributedRequestReceived)).await;
    assert_eq!(by_both.name, EventName::AttachmentSigned);
    by_both.initiator_legal_entity = constructed.initiator_legal_entity;
    by_both
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test]
async fn test_two_nodes_complete_negotiation() {
    let (a, b) = nodes();
    let id = a.service.register_consent(consent_data(MEDICAL)).await.unwrap();

    let signed = fully_signed(&a, &b).await;
    let state: FullConsentRequestState = decode_payload(&signed.payload).unwrap();
    assert!(state.all_signed());

    // Only the initiator finalizes.
    assert!(b
        .deliver(relayed(&signed, EventName::DistributedRequestReceived))
        .await
        .is_none());
    let present = a
        .deliver(signed.renamed(EventName::DistributedRequestReceived))
        .await
        .expect("all-signatures-present");
    assert_eq!(present.name, EventName::AllSignaturesPresent);

    let distributed = present.renamed(EventName::ConsentDistributed);
    assert_eq!(a.deliver(distributed.clone()).await.unwrap().name, EventName::Completed);
    assert_eq!(
        b.deliver(relayed(&distributed, EventName::ConsentDistributed))
            .await
            .unwrap()
            .name,
        EventName::Completed
    );

    for node in [&a, &b] {
        let stored = node.consent_store.find(&signed.external_id).await.unwrap().unwrap();
        assert_eq!(stored.subject, SUBJECT);
        assert_eq!(stored.records.len(), 1);
    }
    assert_eq!(a.consent_status(id).await, ConsentStatus::Completed);
}

#[tokio::test]
async fn test_forged_signature_errors_negotiation() {
    let (a, b) = nodes();
    a.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let signed = fully_signed(&a, &b).await;

    let mut state: FullConsentRequestState = decode_payload(&signed.payload).unwrap();
    let mut records = state.consent_records[0].signatures().to_vec();
    let forged = a.crypto.sign(b"something else", CUSTODIAN).unwrap();
    records[0].signature.data = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, forged);
    state.consent_records[0].signatures = Some(records);
    let mut tampered = signed.renamed(EventName::DistributedRequestReceived);
    tampered.payload = encode_payload(&state).unwrap();

    a.service.handle_bridge_event(&tampered).await.unwrap();

    let published = a.bridge.take();
    let (channel, errored) = published.last().unwrap();
    assert_eq!(*channel, Channel::ConsentRequest);
    assert_eq!(errored.name, EventName::Errored);
    assert!(errored.error.as_deref().unwrap().starts_with("node-a: "));
}

#[tokio::test]
async fn test_unknown_signer_key_errors_negotiation() {
    let (a, b) = nodes();
    a.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let signed = fully_signed(&a, &b).await;

    a.registry.revoke_keys(ACTOR, chrono::Utc::now() - chrono::Duration::days(2));
    let published = a
        .deliver(signed.renamed(EventName::DistributedRequestReceived))
        .await
        .unwrap();
    assert_eq!(published.name, EventName::Errored);
}

#[tokio::test]
async fn test_undecryptable_record_errors() {
    let (a, b) = nodes();
    a.service.register_consent(consent_data(MEDICAL)).await.unwrap();
    let constructed = a.take(EventName::RequestConstructed);

    let mut state: FullConsentRequestState = decode_payload(&constructed.payload).unwrap();
    state.consent_records[0].cipher_text = Some("AAAA".into());
    let mut broken = relayed(&constructed, EventName::DistributedRequestReceived);
    broken.payload = encode_payload(&state).unwrap();

    let errored = b.deliver(broken).await.unwrap();
    assert_eq!(errored.name, EventName::Errored);
    assert_eq!(
        errored.error.as_deref(),
        Some("node-b: could not decrypt consent record")
    );
}
