//! Event definitions and domain events for event sourcing.
//!
//! This module provides:
//! - Identifiers for events and aggregate streams
//! - EventEnvelope for metadata-wrapped events
//! - Domain events for consents, treatment relations and negotiations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregates::negotiation::NegotiationState;

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of aggregate the runtime can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateType {
    Consent,
    TreatmentRelation,
    Negotiation,
}

impl AggregateType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Consent => "consent",
            Self::TreatmentRelation => "treatment-relation",
            Self::Negotiation => "negotiation",
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one aggregate's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
}

impl StreamId {
    pub fn new(aggregate_type: AggregateType, aggregate_id: Uuid) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
        }
    }

    pub fn consent(id: Uuid) -> Self {
        Self::new(AggregateType::Consent, id)
    }

    pub fn treatment_relation(id: Uuid) -> Self {
        Self::new(AggregateType::TreatmentRelation, id)
    }

    pub fn negotiation(id: Uuid) -> Self {
        Self::new(AggregateType::Negotiation, id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.aggregate_type, self.aggregate_id)
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// Discriminant of every domain event, used by bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "consent:request-registered")]
    ConsentRequestRegistered,
    #[serde(rename = "consent:request-rejected")]
    ConsentRequestRejected,
    #[serde(rename = "consent:canceled")]
    ConsentCanceled,
    #[serde(rename = "consent:errored")]
    ConsentErrored,
    #[serde(rename = "consent:marked-unique")]
    ConsentMarkedUnique,
    #[serde(rename = "consent:custodian-checked")]
    CustodianChecked,
    #[serde(rename = "consent:sync-started")]
    SyncStarted,
    #[serde(rename = "consent:completed")]
    ConsentCompleted,
    #[serde(rename = "treatment-relation:reservation-accepted")]
    ReservationAccepted,
    #[serde(rename = "treatment-relation:reservation-rejected")]
    ReservationRejected,
    #[serde(rename = "negotiation:created")]
    NegotiationCreated,
    #[serde(rename = "negotiation:consent-added")]
    ConsentAdded,
    #[serde(rename = "negotiation:prepared")]
    NegotiationPrepared,
    #[serde(rename = "negotiation:consent-proposed")]
    ConsentProposed,
    #[serde(rename = "negotiation:signature-added")]
    SignatureAdded,
    #[serde(rename = "negotiation:all-signed")]
    NegotiationAllSigned,
    #[serde(rename = "negotiation:state-updated")]
    NegotiationStateUpdated,
    #[serde(rename = "negotiation:request-failed")]
    ConsentRequestFailed,
}

impl EventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConsentRequestRegistered => "consent:request-registered",
            Self::ConsentRequestRejected => "consent:request-rejected",
            Self::ConsentCanceled => "consent:canceled",
            Self::ConsentErrored => "consent:errored",
            Self::ConsentMarkedUnique => "consent:marked-unique",
            Self::CustodianChecked => "consent:custodian-checked",
            Self::SyncStarted => "consent:sync-started",
            Self::ConsentCompleted => "consent:completed",
            Self::ReservationAccepted => "treatment-relation:reservation-accepted",
            Self::ReservationRejected => "treatment-relation:reservation-rejected",
            Self::NegotiationCreated => "negotiation:created",
            Self::ConsentAdded => "negotiation:consent-added",
            Self::NegotiationPrepared => "negotiation:prepared",
            Self::ConsentProposed => "negotiation:consent-proposed",
            Self::SignatureAdded => "negotiation:signature-added",
            Self::NegotiationAllSigned => "negotiation:all-signed",
            Self::NegotiationStateUpdated => "negotiation:state-updated",
            Self::ConsentRequestFailed => "negotiation:request-failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Metadata
// =============================================================================

/// Metadata associated with an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier
    pub event_id: EventId,

    /// Event type
    pub event_type: EventType,

    /// Stream/aggregate this event belongs to
    pub stream_id: StreamId,

    /// Aggregate version after applying this event
    pub version: u64,

    /// When the event was committed
    pub timestamp: DateTime<Utc>,

    /// Correlation ID shared by every event of one request
    pub correlation_id: Option<String>,

    /// Causation ID (the event whose saga reaction produced this event)
    pub causation_id: Option<EventId>,
}

impl EventMetadata {
    /// Create new metadata for an event.
    pub fn new(event_type: EventType, stream_id: StreamId, version: u64) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            stream_id,
            version,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }
}

// =============================================================================
// Domain Payloads
// =============================================================================

/// One custodian/subject/actor/class/period consent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentData {
    pub id: Uuid,
    pub custodian_id: String,
    pub subject_id: String,
    pub actor_id: String,
    pub class: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Organization that recorded the consent, when not the custodian.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ConsentProof>,
}

/// Reference to the document proving a consent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentProof {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

// =============================================================================
// Event Enumeration
// =============================================================================

/// All domain events in the system.
///
/// The stream an event belongs to is carried by its envelope, so payloads only
/// hold what the fold and the sagas need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // Consent events
    #[serde(rename = "consent:request-registered")]
    ConsentRequestRegistered(ConsentData),
    #[serde(rename = "consent:request-rejected")]
    ConsentRequestRejected { reason: String },
    #[serde(rename = "consent:canceled")]
    ConsentCanceled { reason: String },
    #[serde(rename = "consent:errored")]
    ConsentErrored { reason: String },
    #[serde(rename = "consent:marked-unique")]
    ConsentMarkedUnique(ConsentData),
    #[serde(rename = "consent:custodian-checked")]
    CustodianChecked(ConsentData),
    #[serde(rename = "consent:sync-started")]
    SyncStarted { sync_id: Uuid },
    #[serde(rename = "consent:completed")]
    ConsentCompleted,

    // Treatment relation events
    #[serde(rename = "treatment-relation:reservation-accepted")]
    ReservationAccepted(ConsentData),
    #[serde(rename = "treatment-relation:reservation-rejected")]
    ReservationRejected { consent_id: Uuid, reason: String },

    // Negotiation events
    #[serde(rename = "negotiation:created")]
    NegotiationCreated {
        external_id: String,
        custodian_id: String,
        subject_id: String,
        actor_id: String,
    },
    #[serde(rename = "negotiation:consent-added")]
    ConsentAdded { consent_id: Uuid, fact: Vec<u8> },
    #[serde(rename = "negotiation:prepared")]
    NegotiationPrepared { fact_count: usize },
    #[serde(rename = "negotiation:consent-proposed")]
    ConsentProposed {
        external_id: String,
        record_hashes: Vec<String>,
    },
    #[serde(rename = "negotiation:signature-added")]
    SignatureAdded {
        consent_hash: String,
        party_id: String,
        signature: Vec<u8>,
    },
    #[serde(rename = "negotiation:all-signed")]
    NegotiationAllSigned { consent_ids: Vec<Uuid> },
    #[serde(rename = "negotiation:state-updated")]
    NegotiationStateUpdated { state: NegotiationState },
    #[serde(rename = "negotiation:request-failed")]
    ConsentRequestFailed {
        consent_id: Option<Uuid>,
        reason: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::ConsentRequestRegistered(_) => EventType::ConsentRequestRegistered,
            DomainEvent::ConsentRequestRejected { .. } => EventType::ConsentRequestRejected,
            DomainEvent::ConsentCanceled { .. } => EventType::ConsentCanceled,
            DomainEvent::ConsentErrored { .. } => EventType::ConsentErrored,
            DomainEvent::ConsentMarkedUnique(_) => EventType::ConsentMarkedUnique,
            DomainEvent::CustodianChecked(_) => EventType::CustodianChecked,
            DomainEvent::SyncStarted { .. } => EventType::SyncStarted,
            DomainEvent::ConsentCompleted => EventType::ConsentCompleted,
            DomainEvent::ReservationAccepted(_) => EventType::ReservationAccepted,
            DomainEvent::ReservationRejected { .. } => EventType::ReservationRejected,
            DomainEvent::NegotiationCreated { .. } => EventType::NegotiationCreated,
            DomainEvent::ConsentAdded { .. } => EventType::ConsentAdded,
            DomainEvent::NegotiationPrepared { .. } => EventType::NegotiationPrepared,
            DomainEvent::ConsentProposed { .. } => EventType::ConsentProposed,
            DomainEvent::SignatureAdded { .. } => EventType::SignatureAdded,
            DomainEvent::NegotiationAllSigned { .. } => EventType::NegotiationAllSigned,
            DomainEvent::NegotiationStateUpdated { .. } => EventType::NegotiationStateUpdated,
            DomainEvent::ConsentRequestFailed { .. } => EventType::ConsentRequestFailed,
        }
    }

    /// The aggregate type that emits this event.
    pub fn aggregate_type(&self) -> AggregateType {
        match self.event_type() {
            EventType::ConsentRequestRegistered
            | EventType::ConsentRequestRejected
            | EventType::ConsentCanceled
            | EventType::ConsentErrored
            | EventType::ConsentMarkedUnique
            | EventType::CustodianChecked
            | EventType::SyncStarted
            | EventType::ConsentCompleted => AggregateType::Consent,
            EventType::ReservationAccepted | EventType::ReservationRejected => {
                AggregateType::TreatmentRelation
            }
            _ => AggregateType::Negotiation,
        }
    }
}

// =============================================================================
// Event Envelope
// =============================================================================

/// A committed event wrapped with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The event data
    pub event: DomainEvent,

    /// Event metadata
    pub metadata: EventMetadata,
}

impl EventEnvelope {
    /// Wrap an event at the given post-application version.
    pub fn new(event: DomainEvent, stream_id: StreamId, version: u64) -> Self {
        let metadata = EventMetadata::new(event.event_type(), stream_id, version);
        Self { event, metadata }
    }

    /// Create with custom metadata.
    pub fn with_metadata(event: DomainEvent, metadata: EventMetadata) -> Self {
        Self { event, metadata }
    }

    pub fn id(&self) -> EventId {
        self.metadata.event_id
    }

    pub fn event_type(&self) -> EventType {
        self.metadata.event_type
    }

    pub fn stream_id(&self) -> StreamId {
        self.metadata.stream_id
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.metadata.stream_id.aggregate_id
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }
}
