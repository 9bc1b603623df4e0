//! Drives a consent through reservation, negotiation and completion.
//!
//! A request enters the flow once it was marked unique and its custodian was
//! checked; canceled and errored requests never reach the negotiation.

use async_trait::async_trait;
use std::sync::Arc;

use super::Saga;
use crate::aggregates::{negotiation_id, treatment_relation_id};
use crate::commands::{Command, CommandKind};
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::events::{ConsentData, DomainEvent, EventEnvelope, EventMatcher, EventType};

const CUSTODIAN_NOT_MANAGED: &str = "Custodian is not managed by this node";
const ALREADY_EXISTS: &str =
    "ConsentRequest already exists for this combination of custodian, actor, subject, class and period";

pub struct ConsentProgressManager {
    crypto: Arc<dyn CryptoProvider>,
}

impl ConsentProgressManager {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { crypto }
    }

    fn custodian_checked(&self, data: &ConsentData) -> Vec<Command> {
        if !self.crypto.private_key_exists(&data.custodian_id) {
            tracing::info!(consent_id = %data.id, "Custodian not managed by this node");
            return vec![Command::reject(data.id, CUSTODIAN_NOT_MANAGED)];
        }

        let external_id = match self
            .crypto
            .calculate_external_id(&data.subject_id, &data.actor_id, &data.custodian_id)
        {
            Ok(external_id) => external_id,
            Err(e) => {
                return vec![Command::reject(
                    data.id,
                    format!("Could not generate treatmentID: {}", e.user_message()),
                )]
            }
        };

        let treatment_relation = treatment_relation_id(&external_id);
        vec![
            Command::new(
                negotiation_id(treatment_relation),
                CommandKind::CreateNegotiation {
                    external_id: hex::encode(&external_id),
                    custodian_id: data.custodian_id.clone(),
                    subject_id: data.subject_id.clone(),
                    actor_id: data.actor_id.clone(),
                },
            ),
            Command::new(treatment_relation, CommandKind::ReserveConsent(data.clone())),
        ]
    }
}

#[async_trait]
impl Saga for ConsentProgressManager {
    fn name(&self) -> &str {
        "consent-progress"
    }

    fn matcher(&self) -> EventMatcher {
        EventMatcher::types([
            EventType::CustodianChecked,
            EventType::ReservationAccepted,
            EventType::ReservationRejected,
            EventType::NegotiationPrepared,
            EventType::ConsentRequestFailed,
            EventType::NegotiationAllSigned,
        ])
    }

    async fn react(&self, envelope: &EventEnvelope) -> Result<Vec<Command>> {
        let commands = match &envelope.event {
            DomainEvent::CustodianChecked(data) => self.custodian_checked(data),
            DomainEvent::ReservationAccepted(data) => {
                let negotiation = negotiation_id(envelope.aggregate_id());
                vec![
                    Command::new(negotiation, CommandKind::AddConsent(data.clone())),
                    Command::new(negotiation, CommandKind::PrepareNegotiation),
                ]
            }
            DomainEvent::ReservationRejected { consent_id, .. } => {
                vec![Command::reject(*consent_id, ALREADY_EXISTS)]
            }
            DomainEvent::NegotiationPrepared { .. } => {
                vec![Command::new(envelope.aggregate_id(), CommandKind::ProposeConsent)]
            }
            DomainEvent::ConsentRequestFailed {
                consent_id: Some(consent_id),
                reason,
            } => vec![Command::mark_as_errored(*consent_id, reason.clone())],
            DomainEvent::NegotiationAllSigned { consent_ids } => consent_ids
                .iter()
                .map(|id| Command::new(*id, CommandKind::MarkAsCompleted))
                .collect(),
            _ => Vec::new(),
        };
        Ok(commands)
    }
}
