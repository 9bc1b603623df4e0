#![allow(clippy::result_large_err)]
//! # Consent Core
//!
//! Multi-party consent coordination between a custodian, a subject and an
//! actor, synchronized encrypted and signed through a ledger bridge.
//!
//! ## Architecture
//!
//! - **Events**: Append-only event log with optimistic concurrency and an in-process bus
//! - **Aggregates**: Consent, treatment relation and negotiation state machines
//! - **Commands**: Typed commands routed to an aggregate runtime
//! - **Sagas**: Process managers turning committed events into follow-up commands
//! - **Sync**: The negotiation protocol over the bridge: hybrid encryption, signatures, distribution
//! - **Collaborators**: Crypto, registry, consent store and fact builder behind narrow traits
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod aggregates;
pub mod api;
pub mod commands;
pub mod config;
pub mod consent_store;
pub mod crypto;
pub mod error;
pub mod events;
pub mod facts;
pub mod registry;
pub mod sagas;
pub mod service;
pub mod sync;
pub mod telemetry;

pub use error::{ConsentError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregates::{
        negotiation_id, treatment_relation_id, Aggregate, AggregateFactory, ConsentAggregate,
        ConsentStatus, NegotiationAggregate, NegotiationState, TreatmentRelationAggregate,
    };
    pub use crate::commands::{AggregateRuntime, Command, CommandKind, CommandRouter, CommandType};
    pub use crate::config::Config;
    pub use crate::consent_store::{ConsentStore, InMemoryConsentStore, PatientConsent};
    pub use crate::crypto::{CryptoProvider, Jwk, LocalCryptoProvider};
    pub use crate::error::{ConsentError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::events::{
        AggregateType, ConsentData, ConsentProof, DomainEvent, EventBus, EventEnvelope, EventHandler, EventId,
        EventMatcher, EventStore, EventType, InMemoryEventStore, StreamId,
    };
    pub use crate::facts::{ConsentFact, ConsentFactBuilder, FhirConsentFactBuilder};
    pub use crate::registry::{InMemoryRegistry, Organization, Registry};
    pub use crate::sagas::{InMemoryUniquenessProjection, Saga, UniquenessProjection};
    pub use crate::service::{Collaborators, ConsentService};
    pub use crate::sync::{
        BridgeEvent, Channel, EventName, EventPublisher, InMemoryBridge, KeyValidityMode, SyncChannel,
    };
}
