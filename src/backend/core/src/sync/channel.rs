//! The negotiation sync channel.
//!
//! Builds the encrypted multi-recipient bridge state for consent facts and
//! reacts to the bridge events of a negotiation's lifecycle:
//!
//! ```text
//! request-constructed ─► distributed-request-received ─► request-valid ─► request-acked
//!        ▲                      │ all signed (initiator)                       │
//!        │                      ▼                                              ▼
//!    propose()          all-signatures-present ─► consent-distributed    attachment-signed
//!                                                       │
//!                                                       ▼
//!                                                   completed
//! ```
//!
//! Failures are published back to the bridge: recoverable ones on the retry
//! channel, fatal ones as `errored` on the request channel. The original
//! event's uuid and external id are always preserved.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::event::{BridgeEvent, Channel, EventName};
use super::key_policy::{KeyValidityMode, KeyValidityPolicy};
use super::publisher::EventPublisher;
use super::state::{
    decode_payload, encode_payload, AsymmetricKey, ConsentId, ConsentRecord, ConsentState,
    FullConsentRequestState, Metadata, PartyAttachmentSignature, Period, SignatureWithKey,
    SymmetricKey, ASYMMETRIC_ALG, SYMMETRIC_ALG,
};
use crate::consent_store::{self, ConsentStore, PatientConsent};
use crate::crypto::local::verify_signature;
use crate::crypto::{CryptoProvider, Jwk};
use crate::error::{ConsentError, ErrorCode, Result};
use crate::facts::{ConsentFact, ConsentFactBuilder};
use crate::registry::Registry;
use crate::telemetry::logging::redact;
use crate::telemetry::BridgeMetrics;

/// Consent facts of one negotiation, ready to be proposed.
#[derive(Debug, Clone, Copy)]
pub struct Proposal<'a> {
    pub negotiation_id: Uuid,
    pub external_id: &'a str,
    pub facts: &'a [Vec<u8>],
}

pub struct SyncChannel {
    registry: Arc<dyn Registry>,
    crypto: Arc<dyn CryptoProvider>,
    publisher: Arc<dyn EventPublisher>,
    fact_builder: Arc<dyn ConsentFactBuilder>,
    consent_store: Arc<dyn ConsentStore>,
    key_policy: Arc<dyn KeyValidityPolicy>,
    identity: String,
    domain: Vec<String>,
}

impl SyncChannel {
    pub fn new(
        registry: Arc<dyn Registry>,
        crypto: Arc<dyn CryptoProvider>,
        publisher: Arc<dyn EventPublisher>,
        fact_builder: Arc<dyn ConsentFactBuilder>,
        consent_store: Arc<dyn ConsentStore>,
    ) -> Self {
        Self {
            registry,
            crypto,
            publisher,
            fact_builder,
            consent_store,
            key_policy: KeyValidityMode::default().policy(),
            identity: String::new(),
            domain: vec!["medical".to_string()],
        }
    }

    /// Node identity used as `initiatingNode` and as prefix of error reasons.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_domain(mut self, domain: Vec<String>) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_key_policy(mut self, policy: Arc<dyn KeyValidityPolicy>) -> Self {
        self.key_policy = policy;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Build & propose
    // ─────────────────────────────────────────────────────────────────────────

    /// Encrypt and publish the facts as a `request-constructed` event.
    ///
    /// Returns the record hashes in fact order. Nothing is returned unless the
    /// bridge accepted the event.
    #[instrument(skip(self, proposal), fields(negotiation_id = %proposal.negotiation_id))]
    pub async fn propose(&self, proposal: Proposal<'_>) -> Result<Vec<String>> {
        let facts = proposal
            .facts
            .iter()
            .map(|payload| self.fact_builder.fact_from_bytes(payload))
            .collect::<Result<Vec<_>>>()?;

        let state = self
            .build_full_consent_request_state(proposal.negotiation_id, proposal.external_id, &facts)
            .await?;
        let hashes = facts.iter().map(ConsentFact::hash).collect();

        let event = BridgeEvent {
            uuid: proposal.negotiation_id.to_string(),
            name: EventName::RequestConstructed,
            initiator_legal_entity: state.initiating_legal_entity.clone(),
            retry_count: 0,
            external_id: proposal.external_id.to_string(),
            payload: encode_payload(&state)?,
            error: None,
        };
        self.publish(Channel::ConsentRequest, event).await?;

        Ok(hashes)
    }

    /// Assemble the bridge state for facts sharing one custodian and actor.
    ///
    /// Legal entities are listed actor first, then custodian; the wrapped keys
    /// of every record follow the same order.
    pub async fn build_full_consent_request_state(
        &self,
        negotiation_id: Uuid,
        external_id: &str,
        facts: &[ConsentFact],
    ) -> Result<FullConsentRequestState> {
        let first = facts
            .first()
            .ok_or_else(|| ConsentError::validation("no consent facts to propose"))?;
        let actor = first
            .actor()
            .ok_or_else(|| ConsentError::invalid_fact("consent fact has no actor"))?
            .to_string();
        let custodian = first.custodian.clone();

        let recipients = [actor.clone(), custodian.clone()];
        let mut keys = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            keys.push(self.recipient_key(recipient).await?);
        }

        let consent_records = facts
            .iter()
            .map(|fact| self.prepare_record(fact, &recipients, &keys))
            .collect::<Result<Vec<_>>>()?;

        let now = Utc::now();
        Ok(FullConsentRequestState {
            consent_id: ConsentId {
                external_id: Some(external_id.to_string()),
                uuid: negotiation_id.to_string(),
            },
            consent_records,
            legal_entities: recipients.to_vec(),
            initiating_legal_entity: custodian,
            initiating_node: Some(self.identity.clone()),
            created_at: Some(now),
            updated_at: Some(now),
            comment: None,
        })
    }

    /// Public key of a recipient: local key material first, the registry otherwise.
    async fn recipient_key(&self, legal_entity: &str) -> Result<Jwk> {
        if self.crypto.private_key_exists(legal_entity) {
            return self.crypto.public_key_as_jwk(legal_entity);
        }

        let organization = self.registry.organization_by_id(legal_entity).await?;
        organization
            .current_public_key(Utc::now())
            .cloned()
            .ok_or_else(|| {
                ConsentError::new(
                    ErrorCode::KeyNotFound,
                    format!(
                        "registry entry for organization {} does not contain a public key",
                        legal_entity
                    ),
                )
            })
    }

    fn prepare_record(
        &self,
        fact: &ConsentFact,
        recipients: &[String],
        keys: &[Jwk],
    ) -> Result<ConsentRecord> {
        let sealed = self.crypto.encrypt_key_and_plain_text(fact.payload(), keys)?;
        let hash = fact.hash();

        let organisation_secure_keys = recipients
            .iter()
            .zip(&sealed.cipher_text_keys)
            .map(|(legal_entity, key)| AsymmetricKey {
                alg: Some(ASYMMETRIC_ALG.to_string()),
                cipher_text: Some(STANDARD.encode(key)),
                legal_entity: legal_entity.clone(),
            })
            .collect();

        Ok(ConsentRecord {
            attachment_hash: Some(hash.clone()),
            cipher_text: Some(STANDARD.encode(&sealed.cipher_text)),
            metadata: Some(Metadata {
                domain: self.domain.clone(),
                period: Period {
                    valid_from: fact.start,
                    valid_to: fact.end,
                },
                secure_key: SymmetricKey {
                    alg: SYMMETRIC_ALG.to_string(),
                    iv: STANDARD.encode(&sealed.nonce),
                },
                organisation_secure_keys,
                consent_record_hash: hash,
                previous_attachment_hash: None,
            }),
            signatures: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receive update
    // ─────────────────────────────────────────────────────────────────────────

    /// Entry point for `distributed-request-received`.
    ///
    /// Routes the outcome of [`receive_event`](Self::receive_event) by the
    /// recoverable-vs-fatal classification of its error.
    #[instrument(skip(self, event), fields(uuid = %event.uuid))]
    pub async fn handle_distributed_request_received(&self, event: &BridgeEvent) -> Result<()> {
        let Err(error) = self.receive_event(event).await else {
            return Ok(());
        };

        let reason = error.user_message().to_string();
        if error.is_retryable() {
            tracing::debug!(reason = %reason, retry_count = event.retry_count, "Bridge event queued for retry");
            self.publish(Channel::ConsentRetry, event.for_retry(reason)).await
        } else {
            tracing::warn!(reason = %reason, code = %error.code(), "Bridge event errored");
            self.publish(Channel::ConsentRequest, event.errored(reason)).await
        }
    }

    /// Process an updated bridge state.
    ///
    /// Publishes `all-signatures-present` (initiator, every signer verified),
    /// `request-valid` (a local party still has to sign and the record
    /// decrypts and validates) or nothing. Errors are not published here.
    pub async fn receive_event(&self, event: &BridgeEvent) -> Result<()> {
        let state: FullConsentRequestState =
            decode_payload(&event.payload).map_err(|e| self.node_error(e.code(), e.user_message()))?;

        if self.all_signed(&state) {
            if !event.is_initiator() {
                tracing::debug!("Not the initiator, waiting for the initiator to finalize");
                BridgeMetrics::event(event.name.as_str(), "ignored");
                return Ok(());
            }

            self.verify_signatures(&state).await?;
            tracing::debug!("All signatures present");
            return self
                .publish(Channel::ConsentRequest, event.renamed(EventName::AllSignaturesPresent))
                .await;
        }

        let mut work = false;
        for record in &state.consent_records {
            let Some(legal_entity) = self.find_first_entity_to_sign_for(record, &state.legal_entities)
            else {
                continue;
            };
            work = true;

            let payload = self.decrypt_consent_record(record, &legal_entity).map_err(|e| {
                tracing::error!(error = %e, legal_entity = %legal_entity, "Could not decrypt consent record");
                self.node_error(ErrorCode::DecryptionFailed, "could not decrypt consent record")
                    .with_source(e)
            })?;

            let valid = match self.fact_builder.verify_fact(&payload) {
                Ok(valid) => valid,
                Err(e) => {
                    tracing::warn!(error = %e, legal_entity = %legal_entity, "Could not verify consent record");
                    return Err(self
                        .node_error(ErrorCode::ConsentFactInvalid, "consent record invalid")
                        .with_source(e));
                }
            };
            if !valid {
                return Err(self.node_error(ErrorCode::ConsentFactInvalid, "consent record invalid"));
            }
        }

        if !work {
            tracing::debug!("Nothing to sign for this node");
            BridgeMetrics::event(event.name.as_str(), "ignored");
            return Ok(());
        }

        self.publish(Channel::ConsentRequest, event.renamed(EventName::RequestValid))
            .await
    }

    /// Every record carries exactly one signature per legal entity.
    pub fn all_signed(&self, state: &FullConsentRequestState) -> bool {
        state.all_signed()
    }

    /// Check that each signer owns the key it claims, at the policy's check time.
    async fn verify_signatures(&self, state: &FullConsentRequestState) -> Result<()> {
        for record in &state.consent_records {
            for signature in record.signatures() {
                let legal_entity = &signature.legal_entity;
                let organization = self.registry.organization_by_id(legal_entity).await.map_err(|e| {
                    ConsentError::registry_unavailable(format!(
                        "Could not get organization public key for: {}",
                        legal_entity
                    ))
                    .with_internal_message(e.to_string())
                })?;

                let jwk = Jwk::from_value(&signature.signature.public_key).map_err(|_| {
                    self.node_error(ErrorCode::InvalidPublicKey, "unable to parse signature public key as JWK")
                })?;

                let check_time = self.key_policy.check_time(signature, state);
                let owned = organization.has_key(&jwk, check_time).map_err(|_| {
                    self.node_error(ErrorCode::InvalidPublicKey, "could not check JWK against organization keys")
                })?;
                if !owned {
                    return Err(self.node_error(
                        ErrorCode::InvalidPublicKey,
                        format!(
                            "organization {} did not have a valid signature for the corresponding public key at the given time {}",
                            legal_entity, check_time
                        ),
                    ));
                }

                if !signature_matches(signature, &jwk) {
                    return Err(self.node_error(
                        ErrorCode::SigningFailed,
                        format!("signature of {} does not match its public key", legal_entity),
                    ));
                }
            }
        }
        Ok(())
    }

    /// First legal entity, in the bridge's order, that has not signed and whose key this node holds.
    pub fn find_first_entity_to_sign_for(
        &self,
        record: &ConsentRecord,
        legal_entities: &[String],
    ) -> Option<String> {
        legal_entities
            .iter()
            .find(|entity| !record.is_signed_by(entity) && self.crypto.private_key_exists(entity))
            .cloned()
    }

    fn decrypt_consent_record(&self, record: &ConsentRecord, legal_entity: &str) -> Result<Vec<u8>> {
        let cipher_text = STANDARD.decode(
            record
                .cipher_text
                .as_deref()
                .ok_or_else(|| ConsentError::malformed_payload("missing cipher text in consentRequest"))?,
        )?;
        let metadata = record
            .metadata
            .as_ref()
            .ok_or_else(|| ConsentError::malformed_payload("missing metadata in consentRequest"))?;
        let wrapped_key = metadata
            .key_for(legal_entity)
            .ok_or_else(|| {
                ConsentError::new(
                    ErrorCode::KeyNotFound,
                    format!("no key found for legalEntity: {}", legal_entity),
                )
            })?;
        let wrapped_key = STANDARD.decode(wrapped_key)?;
        let nonce = STANDARD.decode(&metadata.secure_key.iv)?;

        self.crypto
            .decrypt_key_and_cipher_text(&cipher_text, &wrapped_key, &nonce, legal_entity)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acknowledge & sign
    // ─────────────────────────────────────────────────────────────────────────

    /// Auto-acknowledge: republish `request-valid` as `request-acked`.
    pub async fn handle_consent_request_valid(&self, event: &BridgeEvent) -> Result<()> {
        self.publish(Channel::ConsentRequest, event.renamed(EventName::RequestAcked))
            .await
    }

    /// Sign for the first local party still missing and publish `attachment-signed`.
    #[instrument(skip(self, event), fields(uuid = %event.uuid))]
    pub async fn handle_consent_request_acked(&self, event: &BridgeEvent) -> Result<()> {
        match self.sign(event) {
            Ok(state) => {
                let mut signed = event.renamed(EventName::AttachmentSigned);
                signed.payload = encode_payload(&state)?;
                self.publish(Channel::ConsentRequest, signed).await
            }
            Err(error) => {
                let reason = format!("{}: could not sign request {}", self.identity, error.user_message());
                tracing::warn!(reason = %reason, "Signing failed");
                self.publish(Channel::ConsentRequest, event.errored(reason)).await
            }
        }
    }

    /// Add one signature to the first record with local work.
    pub fn sign(&self, event: &BridgeEvent) -> Result<FullConsentRequestState> {
        let mut state: FullConsentRequestState = decode_payload(&event.payload)?;
        let legal_entities = state.legal_entities.clone();

        for record in state.consent_records.iter_mut() {
            let Some(legal_entity) = self.find_first_entity_to_sign_for(record, &legal_entities) else {
                continue;
            };

            let hash = record
                .signing_hash()
                .ok_or_else(|| ConsentError::malformed_payload("consent record has no attachment hash"))?
                .to_string();
            tracing::debug!(legal_entity = %legal_entity, hash = %hash, "Signing consent record");

            let signature = self.crypto.sign(&hex::decode(&hash)?, &legal_entity)?;
            let public_key = self.crypto.public_key_as_jwk(&legal_entity)?;

            record.add_signature(PartyAttachmentSignature {
                attachment: hash,
                legal_entity,
                signature: SignatureWithKey {
                    data: STANDARD.encode(signature),
                    public_key: serde_json::to_value(public_key)?,
                },
            });
            state.updated_at = Some(Utc::now());
            return Ok(state);
        }

        Err(ConsentError::validation("nothing to sign for this node"))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Distribute
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a finalized negotiation when it concerns a local party.
    ///
    /// Returns the stored consent, or `None` when the negotiation was dropped
    /// as irrelevant for this node.
    #[instrument(skip(self, event), fields(uuid = %event.uuid))]
    pub async fn handle_consent_distributed(&self, event: &BridgeEvent) -> Result<Option<PatientConsent>> {
        let state: ConsentState = decode_payload(&event.payload)?;
        let external_id = state
            .consent_id
            .external_id
            .clone()
            .ok_or_else(|| ConsentError::malformed_payload("distributed consent has no external id"))?;

        let mut facts: Vec<(ConsentFact, String, Option<String>)> = Vec::new();
        for record in &state.consent_records {
            let Some(hash) = record.signing_hash() else {
                continue;
            };
            if facts.iter().any(|(_, h, _)| h == hash) {
                continue;
            }
            let Some(metadata) = record.metadata.as_ref() else {
                continue;
            };

            let local = metadata
                .organisation_secure_keys
                .iter()
                .find(|k| self.crypto.private_key_exists(&k.legal_entity));
            let Some(local) = local else {
                continue;
            };

            let payload = self.decrypt_consent_record(record, &local.legal_entity)?;
            let fact = self.fact_builder.fact_from_bytes(&payload)?;
            facts.push((fact, hash.to_string(), metadata.previous_attachment_hash.clone()));
        }

        let Some(consent) = patient_consent_from_facts(external_id, facts) else {
            tracing::info!("Distributed consent has no record for this node");
            BridgeMetrics::event(event.name.as_str(), "ignored");
            return Ok(None);
        };

        if !self.is_relevant_for_this_node(&consent) {
            tracing::info!(
                subject = %redact(&consent.subject),
                "Distributed consent is irrelevant for this node"
            );
            BridgeMetrics::event(event.name.as_str(), "ignored");
            return Ok(None);
        }

        tracing::debug!(records = consent.records.len(), "Storing distributed consent");
        self.consent_store.record_consent(vec![consent.clone()]).await?;

        self.publish(Channel::ConsentRequest, event.renamed(EventName::Completed))
            .await?;
        Ok(Some(consent))
    }

    /// Custodian or actor is managed by this node.
    fn is_relevant_for_this_node(&self, consent: &PatientConsent) -> bool {
        self.crypto.private_key_exists(&consent.custodian) || self.crypto.private_key_exists(&consent.actor)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn publish(&self, channel: Channel, event: BridgeEvent) -> Result<()> {
        let name = event.name;
        match self.publisher.publish(channel, event).await {
            Ok(()) => {
                BridgeMetrics::event(name.as_str(), "published");
                Ok(())
            }
            Err(error) => {
                BridgeMetrics::event(name.as_str(), "publish_failed");
                tracing::error!(error = %error, channel = %channel, name = %name, "Could not publish bridge event");
                Err(error)
            }
        }
    }

    fn node_error(&self, code: ErrorCode, message: impl std::fmt::Display) -> ConsentError {
        ConsentError::new(code, format!("{}: {}", self.identity, message))
    }
}

fn signature_matches(signature: &PartyAttachmentSignature, jwk: &Jwk) -> bool {
    let (Ok(hash), Ok(data)) = (
        hex::decode(&signature.attachment),
        STANDARD.decode(&signature.signature.data),
    ) else {
        return false;
    };
    verify_signature(jwk, &hash, &data).unwrap_or(false)
}

/// Collapse the decrypted facts of one negotiation into a single patient consent.
fn patient_consent_from_facts(
    external_id: String,
    facts: Vec<(ConsentFact, String, Option<String>)>,
) -> Option<PatientConsent> {
    let (first, _, _) = facts.first()?;
    let mut consent = PatientConsent {
        id: external_id,
        actor: first.actor().unwrap_or_default().to_string(),
        custodian: first.custodian.clone(),
        subject: first.subject.clone(),
        records: Vec::with_capacity(facts.len()),
    };

    for (fact, hash, previous_hash) in facts {
        consent.records.push(consent_store::ConsentRecord {
            data_classes: fact.classes.clone(),
            valid_from: fact.start,
            valid_to: fact.end,
            hash,
            previous_hash,
        });
    }
    Some(consent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent_store::InMemoryConsentStore;
    use crate::crypto::LocalCryptoProvider;
    use crate::events::ConsentData;
    use crate::facts::FhirConsentFactBuilder;
    use crate::registry::InMemoryRegistry;
    use crate::sync::publisher::InMemoryBridge;
    use chrono::TimeZone;

    const CUSTODIAN: &str = "urn:oid:2.16.840.1.113883.2.4.6.1:00000001";
    const ACTOR: &str = "urn:oid:2.16.840.1.113883.2.4.6.1:00000002";
    const NODE: &str = "urn:oid:1.3.6.1.4.1.54851.4:123";

    struct Fixture {
        crypto: Arc<LocalCryptoProvider>,
        registry: Arc<InMemoryRegistry>,
        bridge: Arc<InMemoryBridge>,
        store: Arc<InMemoryConsentStore>,
        channel: SyncChannel,
    }

    fn fixture(local: &[&str]) -> Fixture {
        let node_crypto = Arc::new(LocalCryptoProvider::new(1024));
        // Parties not managed by this node keep their keys elsewhere.
        let remote = LocalCryptoProvider::new(1024);
        let registry = Arc::new(InMemoryRegistry::new());
        for entity in [CUSTODIAN, ACTOR] {
            let holder: &LocalCryptoProvider = if local.contains(&entity) { node_crypto.as_ref() } else { &remote };
            holder.generate_key_pair(entity).unwrap();
            registry.publish_key(
                entity,
                holder.public_key_as_jwk(entity).unwrap(),
                Utc::now() - chrono::Duration::days(1),
            );
        }

        let bridge = Arc::new(InMemoryBridge::new("test"));
        let store = Arc::new(InMemoryConsentStore::new());
        let channel = SyncChannel::new(
            registry.clone(),
            node_crypto.clone(),
            bridge.clone(),
            Arc::new(FhirConsentFactBuilder::new()),
            store.clone(),
        )
        .with_identity(NODE);

        Fixture {
            crypto: node_crypto,
            registry,
            bridge,
            store,
            channel,
        }
    }

    fn fact_payload() -> Vec<u8> {
        FhirConsentFactBuilder::new()
            .build_fact(&ConsentData {
                id: Uuid::new_v4(),
                custodian_id: CUSTODIAN.into(),
                subject_id: "urn:oid:2.16.840.1.113883.2.4.6.3:999999990".into(),
                actor_id: ACTOR.into(),
                class: "urn:oid:1.3.6.1.4.1.54851.1:MEDICAL".into(),
                start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end: None,
                performer_id: None,
                proof: None,
            })
            .unwrap()
    }

    async fn proposed(fixture: &Fixture) -> BridgeEvent {
        let facts = vec![fact_payload()];
        fixture
            .channel
            .propose(Proposal {
                negotiation_id: Uuid::new_v4(),
                external_id: "ext",
                facts: &facts,
            })
            .await
            .unwrap();
        fixture.bridge.take().pop().unwrap().1
    }

    #[tokio::test]
    async fn test_propose_builds_state_in_actor_custodian_order() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;

        assert_eq!(event.name, EventName::RequestConstructed);
        assert_eq!(event.initiator_legal_entity, CUSTODIAN);
        assert_eq!(event.retry_count, 0);

        let state: FullConsentRequestState = decode_payload(&event.payload).unwrap();
        assert_eq!(state.legal_entities, vec![ACTOR.to_string(), CUSTODIAN.to_string()]);
        assert_eq!(state.initiating_node.as_deref(), Some(NODE));
        let metadata = state.consent_records[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.secure_key.alg, "AES_GCM");
        assert_eq!(metadata.domain, vec!["medical".to_string()]);
        let order: Vec<&str> = metadata
            .organisation_secure_keys
            .iter()
            .map(|k| k.legal_entity.as_str())
            .collect();
        assert_eq!(order, vec![ACTOR, CUSTODIAN]);
        assert_eq!(
            state.consent_records[0].attachment_hash.as_deref(),
            Some(metadata.consent_record_hash.as_str())
        );
    }

    #[tokio::test]
    async fn test_propose_fails_without_publishing_when_bridge_down() {
        let fixture = fixture(&[CUSTODIAN]);
        fixture.bridge.set_available(false);
        let facts = vec![fact_payload()];

        let err = fixture
            .channel
            .propose(Proposal {
                negotiation_id: Uuid::new_v4(),
                external_id: "ext",
                facts: &facts,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_receive_publishes_request_valid_for_local_signer() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;

        fixture
            .channel
            .handle_distributed_request_received(&event.renamed(EventName::DistributedRequestReceived))
            .await
            .unwrap();

        let published = fixture.bridge.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.name, EventName::RequestValid);
    }

    #[tokio::test]
    async fn test_receive_without_local_work_is_noop() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;
        let other_node = self::fixture(&[]);

        other_node
            .channel
            .handle_distributed_request_received(&event)
            .await
            .unwrap();
        assert!(other_node.bridge.published().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_errored_not_retried() {
        let fixture = fixture(&[CUSTODIAN]);
        let mut event = proposed(&fixture).await;
        event.payload = "not base64!".into();

        fixture
            .channel
            .handle_distributed_request_received(&event)
            .await
            .unwrap();

        let (channel, errored) = fixture.bridge.take().pop().unwrap();
        assert_eq!(channel, Channel::ConsentRequest);
        assert_eq!(errored.name, EventName::Errored);
        assert_eq!(
            errored.error.as_deref(),
            Some(format!("{NODE}: could not base64 decode event payload").as_str())
        );
        assert_eq!(errored.uuid, event.uuid);
    }

    /// FHIR facts whose verification backend fails.
    struct UnverifiableFacts(FhirConsentFactBuilder);

    impl ConsentFactBuilder for UnverifiableFacts {
        fn build_fact(&self, data: &ConsentData) -> Result<Vec<u8>> {
            self.0.build_fact(data)
        }

        fn verify_fact(&self, _payload: &[u8]) -> Result<bool> {
            Err(ConsentError::internal("fact verifier unavailable"))
        }

        fn fact_from_bytes(&self, payload: &[u8]) -> Result<ConsentFact> {
            self.0.fact_from_bytes(payload)
        }
    }

    #[tokio::test]
    async fn test_verification_error_errors_request() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;
        let channel = SyncChannel::new(
            fixture.registry.clone(),
            fixture.crypto.clone(),
            fixture.bridge.clone(),
            Arc::new(UnverifiableFacts(FhirConsentFactBuilder::new())),
            fixture.store.clone(),
        )
        .with_identity(NODE);

        let err = channel.receive_event(&event).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConsentFactInvalid);
        assert!(std::error::Error::source(&err).is_some());

        channel.handle_distributed_request_received(&event).await.unwrap();
        let (channel, errored) = fixture.bridge.take().pop().unwrap();
        assert_eq!(channel, Channel::ConsentRequest);
        assert_eq!(errored.name, EventName::Errored);
        assert_eq!(
            errored.error.as_deref(),
            Some(format!("{NODE}: consent record invalid").as_str())
        );
    }

    #[tokio::test]
    async fn test_sign_until_all_signed_then_finalize() {
        let fixture = fixture(&[CUSTODIAN, ACTOR]);
        let event = proposed(&fixture).await;

        let first = fixture.channel.sign(&event).unwrap();
        assert_eq!(first.consent_records[0].signatures()[0].legal_entity, ACTOR);

        let mut event = event.clone();
        event.payload = encode_payload(&first).unwrap();
        let second = fixture.channel.sign(&event).unwrap();
        assert!(fixture.channel.all_signed(&second));

        event.payload = encode_payload(&second).unwrap();
        assert_eq!(
            fixture.channel.sign(&event).unwrap_err().user_message(),
            "nothing to sign for this node"
        );

        fixture.channel.receive_event(&event).await.unwrap();
        let published = fixture.bridge.take();
        assert_eq!(published[0].1.name, EventName::AllSignaturesPresent);
    }

    #[tokio::test]
    async fn test_finalize_rejects_revoked_signer_key() {
        let fixture = fixture(&[CUSTODIAN, ACTOR]);
        let mut event = proposed(&fixture).await;
        let first = fixture.channel.sign(&event).unwrap();
        event.payload = encode_payload(&first).unwrap();
        let second = fixture.channel.sign(&event).unwrap();
        event.payload = encode_payload(&second).unwrap();

        fixture.registry.revoke_keys(ACTOR, Utc::now() - chrono::Duration::hours(1));

        let err = fixture.channel.receive_event(&event).await.unwrap_err();
        assert!(err
            .user_message()
            .contains(&format!("organization {ACTOR} did not have a valid signature")));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_finalize_unknown_signer_goes_to_retry() {
        let fixture = fixture(&[CUSTODIAN, ACTOR]);
        let mut event = proposed(&fixture).await;
        for _ in 0..2 {
            let signed = fixture.channel.sign(&event).unwrap();
            event.payload = encode_payload(&signed).unwrap();
        }

        let empty_registry = SyncChannel::new(
            Arc::new(InMemoryRegistry::new()),
            fixture.crypto.clone(),
            fixture.bridge.clone(),
            Arc::new(FhirConsentFactBuilder::new()),
            fixture.store.clone(),
        );
        empty_registry
            .handle_distributed_request_received(&event)
            .await
            .unwrap();

        let (channel, retried) = fixture.bridge.take().pop().unwrap();
        assert_eq!(channel, Channel::ConsentRetry);
        assert_eq!(retried.name, event.name);
        assert_eq!(
            retried.error.as_deref(),
            Some(format!("Could not get organization public key for: {ACTOR}").as_str())
        );
    }

    #[tokio::test]
    async fn test_acked_publishes_attachment_signed() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;

        fixture
            .channel
            .handle_consent_request_acked(&event.renamed(EventName::RequestAcked))
            .await
            .unwrap();

        let (_, signed) = fixture.bridge.take().pop().unwrap();
        assert_eq!(signed.name, EventName::AttachmentSigned);
        let state: FullConsentRequestState = decode_payload(&signed.payload).unwrap();
        let signature = &state.consent_records[0].signatures()[0];
        assert_eq!(signature.legal_entity, CUSTODIAN);
        let jwk = Jwk::from_value(&signature.signature.public_key).unwrap();
        assert!(signature_matches(signature, &jwk));
    }

    #[tokio::test]
    async fn test_distributed_consent_stored_when_relevant() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;

        let consent = fixture
            .channel
            .handle_consent_distributed(&event.renamed(EventName::ConsentDistributed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consent.id, "ext");
        assert_eq!(consent.custodian, CUSTODIAN);
        assert_eq!(consent.actor, ACTOR);
        assert_eq!(consent.records.len(), 1);
        assert_eq!(fixture.store.len(), 1);
        assert_eq!(fixture.bridge.take().pop().unwrap().1.name, EventName::Completed);
    }

    #[tokio::test]
    async fn test_distributed_consent_dropped_when_irrelevant() {
        let fixture = fixture(&[CUSTODIAN]);
        let event = proposed(&fixture).await;
        let other_node = self::fixture(&[]);

        let stored = other_node
            .channel
            .handle_consent_distributed(&event)
            .await
            .unwrap();
        assert!(stored.is_none());
        assert!(other_node.store.is_empty());
        assert!(other_node.bridge.published().is_empty());
    }
}
