//! Negotiation aggregate.
//!
//! Accumulates the consent facts of one custodian/subject/actor triple,
//! proposes them through the sync channel and mirrors the signatures collected
//! on the bridge.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{Aggregate, AggregateFactory};
use crate::commands::{Command, CommandKind};
use crate::error::{ConsentError, Result};
use crate::events::{AggregateType, ConsentData, DomainEvent};
use crate::facts::ConsentFactBuilder;
use crate::sync::{Proposal, SyncChannel};

/// Negotiation id belonging to a treatment relation.
pub fn negotiation_id(treatment_relation_id: Uuid) -> Uuid {
    Uuid::new_v5(&treatment_relation_id, b"negotiation")
}

/// Last known bridge-side state of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum NegotiationState {
    #[default]
    Draft,
    Proposed {
        external_id: String,
    },
    Signing {
        signed: usize,
        expected: usize,
    },
    AllSigned,
    Errored {
        reason: String,
    },
}

pub struct NegotiationAggregate {
    id: Uuid,
    version: u64,
    created: bool,
    external_id: String,
    custodian_id: String,
    subject_id: String,
    actor_id: String,
    consent_ids: Vec<Uuid>,
    facts: Vec<Vec<u8>>,
    /// consent record hash -> party -> signature
    signatures: HashMap<String, HashMap<String, Vec<u8>>>,
    record_hashes: Vec<String>,
    state: NegotiationState,
    fact_builder: Arc<dyn ConsentFactBuilder>,
    channel: Arc<SyncChannel>,
}

impl NegotiationAggregate {
    pub fn new(id: Uuid, fact_builder: Arc<dyn ConsentFactBuilder>, channel: Arc<SyncChannel>) -> Self {
        Self {
            id,
            version: 0,
            created: false,
            external_id: String::new(),
            custodian_id: String::new(),
            subject_id: String::new(),
            actor_id: String::new(),
            consent_ids: Vec::new(),
            facts: Vec::new(),
            signatures: HashMap::new(),
            record_hashes: Vec::new(),
            state: NegotiationState::Draft,
            fact_builder,
            channel,
        }
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn custodian_id(&self) -> &str {
        &self.custodian_id
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn consent_ids(&self) -> &[Uuid] {
        &self.consent_ids
    }

    pub fn facts(&self) -> &[Vec<u8>] {
        &self.facts
    }

    pub fn record_hashes(&self) -> &[String] {
        &self.record_hashes
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Parties expected to sign every record.
    pub fn legal_entities(&self) -> Vec<String> {
        let mut entities = vec![self.actor_id.clone()];
        if self.custodian_id != self.actor_id {
            entities.push(self.custodian_id.clone());
        }
        entities
    }

    /// One signature per expected legal entity for the record with `hash`.
    pub fn is_fully_signed(&self, hash: &str, legal_entities: &[String]) -> bool {
        self.signatures.get(hash).is_some_and(|parties| {
            parties.len() == legal_entities.len() && legal_entities.iter().all(|e| parties.contains_key(e))
        })
    }

    fn has_signature(&self, hash: &str, party: &str) -> bool {
        self.signatures
            .get(hash)
            .is_some_and(|parties| parties.contains_key(party))
    }

    fn signature_count(&self) -> usize {
        self.signatures.values().map(HashMap::len).sum()
    }

    fn add_consent(&self, data: &ConsentData) -> DomainEvent {
        let failed = |reason: String| DomainEvent::ConsentRequestFailed {
            consent_id: Some(data.id),
            reason,
        };

        let fact = match self.fact_builder.build_fact(data) {
            Ok(fact) => fact,
            Err(e) => return failed(format!("could not build consent fact: {}", e.user_message())),
        };
        match self.fact_builder.verify_fact(&fact) {
            Ok(true) => DomainEvent::ConsentAdded {
                consent_id: data.id,
                fact,
            },
            Ok(false) => failed("consent fact is invalid".to_string()),
            Err(e) => failed(format!("could not verify consent fact: {}", e.user_message())),
        }
    }
}

#[async_trait]
impl Aggregate for NegotiationAggregate {
    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Negotiation
    }

    fn version(&self) -> u64 {
        self.version
    }

    async fn handle(&self, command: &Command) -> Result<Vec<DomainEvent>> {
        if let CommandKind::CreateNegotiation {
            external_id,
            custodian_id,
            subject_id,
            actor_id,
        } = &command.kind
        {
            if self.created {
                tracing::debug!(negotiation_id = %self.id, "Negotiation already created");
                return Ok(vec![]);
            }
            return Ok(vec![DomainEvent::NegotiationCreated {
                external_id: external_id.clone(),
                custodian_id: custodian_id.clone(),
                subject_id: subject_id.clone(),
                actor_id: actor_id.clone(),
            }]);
        }

        if !self.created {
            return Err(ConsentError::aggregate_not_found(AggregateType::Negotiation, self.id));
        }

        match &command.kind {
            CommandKind::AddConsent(data) => Ok(vec![self.add_consent(data)]),
            CommandKind::PrepareNegotiation => {
                if self.facts.is_empty() {
                    return Ok(vec![DomainEvent::ConsentRequestFailed {
                        consent_id: None,
                        reason: "negotiation has no consent facts".to_string(),
                    }]);
                }
                Ok(vec![DomainEvent::NegotiationPrepared {
                    fact_count: self.facts.len(),
                }])
            }
            CommandKind::ProposeConsent => {
                let record_hashes = self
                    .channel
                    .propose(Proposal {
                        negotiation_id: self.id,
                        external_id: &self.external_id,
                        facts: &self.facts,
                    })
                    .await?;
                Ok(vec![DomainEvent::ConsentProposed {
                    external_id: self.external_id.clone(),
                    record_hashes,
                }])
            }
            CommandKind::AddSignature {
                consent_hash,
                party_id,
                signature,
            } => {
                if self.has_signature(consent_hash, party_id) {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::SignatureAdded {
                    consent_hash: consent_hash.clone(),
                    party_id: party_id.clone(),
                    signature: signature.clone(),
                }])
            }
            CommandKind::MarkAllSigned => {
                if self.state == NegotiationState::AllSigned {
                    return Ok(vec![]);
                }
                Ok(vec![DomainEvent::NegotiationAllSigned {
                    consent_ids: self.consent_ids.clone(),
                }])
            }
            CommandKind::UpdateNegotiationState { state } => {
                Ok(vec![DomainEvent::NegotiationStateUpdated { state: state.clone() }])
            }
            other => Err(ConsentError::unknown_command(other.command_type())),
        }
    }

    fn apply(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::NegotiationCreated {
                external_id,
                custodian_id,
                subject_id,
                actor_id,
            } => {
                self.created = true;
                self.external_id = external_id.clone();
                self.custodian_id = custodian_id.clone();
                self.subject_id = subject_id.clone();
                self.actor_id = actor_id.clone();
                self.state = NegotiationState::Draft;
            }
            DomainEvent::ConsentAdded { consent_id, fact } => {
                self.consent_ids.push(*consent_id);
                self.facts.push(fact.clone());
            }
            DomainEvent::ConsentProposed {
                external_id,
                record_hashes,
            } => {
                self.record_hashes = record_hashes.clone();
                self.state = NegotiationState::Proposed {
                    external_id: external_id.clone(),
                };
            }
            DomainEvent::SignatureAdded {
                consent_hash,
                party_id,
                signature,
            } => {
                self.signatures
                    .entry(consent_hash.clone())
                    .or_default()
                    .insert(party_id.clone(), signature.clone());
                if self.state != NegotiationState::AllSigned {
                    self.state = NegotiationState::Signing {
                        signed: self.signature_count(),
                        expected: self.record_hashes.len() * self.legal_entities().len(),
                    };
                }
            }
            DomainEvent::NegotiationAllSigned { .. } => {
                self.state = NegotiationState::AllSigned;
            }
            DomainEvent::NegotiationStateUpdated { state } => {
                self.state = state.clone();
            }
            DomainEvent::ConsentRequestFailed {
                consent_id: None,
                reason,
            } => {
                self.state = NegotiationState::Errored {
                    reason: reason.clone(),
                };
            }
            _ => {}
        }
        self.version += 1;
    }
}

/// Builds negotiations wired to the node's fact builder and sync channel.
pub struct NegotiationAggregateFactory {
    fact_builder: Arc<dyn ConsentFactBuilder>,
    channel: Arc<SyncChannel>,
}

impl NegotiationAggregateFactory {
    pub fn new(fact_builder: Arc<dyn ConsentFactBuilder>, channel: Arc<SyncChannel>) -> Self {
        Self { fact_builder, channel }
    }
}

impl AggregateFactory for NegotiationAggregateFactory {
    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Negotiation
    }

    fn create(&self, id: Uuid) -> Box<dyn Aggregate> {
        Box::new(NegotiationAggregate::new(
            id,
            self.fact_builder.clone(),
            self.channel.clone(),
        ))
    }
}
