//! Aggregates - event-sourced consistency boundaries.
//!
//! An aggregate's visible state is the left fold of [`Aggregate::apply`] over
//! its committed stream. `handle` decides, `apply` records; only `apply`
//! mutates state and it never fails.

pub mod consent;
pub mod negotiation;
pub mod treatment_relation;

pub use consent::{ConsentAggregate, ConsentAggregateFactory, ConsentStatus};
pub use negotiation::{
    negotiation_id, NegotiationAggregate, NegotiationAggregateFactory, NegotiationState,
};
pub use treatment_relation::{
    treatment_relation_id, TreatmentRelationAggregate, TreatmentRelationAggregateFactory,
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::commands::Command;
use crate::error::Result;
use crate::events::{AggregateType, DomainEvent, EventEnvelope};

/// A command-handling state machine rebuilt from its event stream.
#[async_trait]
pub trait Aggregate: Send + Sync {
    fn aggregate_id(&self) -> Uuid;

    fn aggregate_type(&self) -> AggregateType;

    /// Number of events applied so far.
    fn version(&self) -> u64;

    /// Decide which events a command produces against the current state.
    ///
    /// Returning an empty list is a valid no-op outcome.
    async fn handle(&self, command: &Command) -> Result<Vec<DomainEvent>>;

    /// Apply one event; increments the version by one.
    fn apply(&mut self, event: &DomainEvent);

    /// Fold a committed stream on top of the current state.
    fn replay(&mut self, events: &[EventEnvelope]) {
        for envelope in events {
            self.apply(&envelope.event);
        }
    }
}

/// Builds empty aggregates of one type.
pub trait AggregateFactory: Send + Sync {
    fn aggregate_type(&self) -> AggregateType;

    fn create(&self, id: Uuid) -> Box<dyn Aggregate>;
}
