//! Treatment relation aggregate.
//!
//! One instance per custodian/subject/actor triple. It holds the accepted
//! reservations so that at most one consent exists per class and period.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Aggregate, AggregateFactory};
use crate::commands::{Command, CommandKind};
use crate::error::{ConsentError, Result};
use crate::events::{AggregateType, ConsentData, DomainEvent};

const DUPLICATE_RESERVATION: &str = "reservation exists for class and period";

/// Treatment relation id for the external id bytes of a custodian/subject/actor triple.
pub fn treatment_relation_id(external_id: &[u8]) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, external_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreatmentRelationAggregate {
    id: Uuid,
    version: u64,
    reservations: Vec<ConsentData>,
}

impl TreatmentRelationAggregate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            reservations: Vec::new(),
        }
    }

    pub fn reservations(&self) -> &[ConsentData] {
        &self.reservations
    }

    fn is_reserved(&self, class: &str, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
        self.reservations
            .iter()
            .any(|r| r.class == class && r.start == start && r.end == end)
    }
}

#[async_trait]
impl Aggregate for TreatmentRelationAggregate {
    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::TreatmentRelation
    }

    fn version(&self) -> u64 {
        self.version
    }

    async fn handle(&self, command: &Command) -> Result<Vec<DomainEvent>> {
        match &command.kind {
            CommandKind::ReserveConsent(data) => {
                if self.is_reserved(&data.class, data.start, data.end) {
                    tracing::debug!(
                        treatment_relation_id = %self.id,
                        consent_id = %data.id,
                        "Reservation rejected"
                    );
                    return Ok(vec![DomainEvent::ReservationRejected {
                        consent_id: data.id,
                        reason: DUPLICATE_RESERVATION.to_string(),
                    }]);
                }
                Ok(vec![DomainEvent::ReservationAccepted(data.clone())])
            }
            other => Err(ConsentError::unknown_command(other.command_type())),
        }
    }

    fn apply(&mut self, event: &DomainEvent) {
        if let DomainEvent::ReservationAccepted(data) = event {
            self.reservations.push(data.clone());
        }
        self.version += 1;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TreatmentRelationAggregateFactory;

impl AggregateFactory for TreatmentRelationAggregateFactory {
    fn aggregate_type(&self) -> AggregateType {
        AggregateType::TreatmentRelation
    }

    fn create(&self, id: Uuid) -> Box<dyn Aggregate> {
        Box::new(TreatmentRelationAggregate::new(id))
    }
}
