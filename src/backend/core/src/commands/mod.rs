//! Commands: typed, immutable instructions addressed to one aggregate instance.
//!
//! Commands carry no version. The runtime loads the aggregate at dispatch time
//! and relies on the append conflict check for consistency.

pub mod router;

pub use router::{AggregateRuntime, CommandRouter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregates::negotiation::NegotiationState;
use crate::events::{AggregateType, ConsentData, EventId};

/// Discriminant of every command, used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "consent:register")]
    RegisterConsent,
    #[serde(rename = "consent:reject")]
    RejectConsentRequest,
    #[serde(rename = "consent:cancel")]
    CancelConsent,
    #[serde(rename = "consent:mark-as-errored")]
    MarkAsErrored,
    #[serde(rename = "consent:mark-as-unique")]
    MarkAsUnique,
    #[serde(rename = "consent:mark-custodian-checked")]
    MarkCustodianChecked,
    #[serde(rename = "consent:start-sync")]
    StartSync,
    #[serde(rename = "consent:mark-as-completed")]
    MarkAsCompleted,
    #[serde(rename = "treatment-relation:reserve-consent")]
    ReserveConsent,
    #[serde(rename = "negotiation:create")]
    CreateNegotiation,
    #[serde(rename = "negotiation:add-consent")]
    AddConsent,
    #[serde(rename = "negotiation:prepare")]
    PrepareNegotiation,
    #[serde(rename = "negotiation:propose-fact")]
    ProposeConsent,
    #[serde(rename = "negotiation:add-signature")]
    AddSignature,
    #[serde(rename = "negotiation:mark-all-signed")]
    MarkAllSigned,
    #[serde(rename = "negotiation:update-state")]
    UpdateNegotiationState,
}

impl CommandType {
    pub const ALL: [CommandType; 16] = [
        Self::RegisterConsent,
        Self::RejectConsentRequest,
        Self::CancelConsent,
        Self::MarkAsErrored,
        Self::MarkAsUnique,
        Self::MarkCustodianChecked,
        Self::StartSync,
        Self::MarkAsCompleted,
        Self::ReserveConsent,
        Self::CreateNegotiation,
        Self::AddConsent,
        Self::PrepareNegotiation,
        Self::ProposeConsent,
        Self::AddSignature,
        Self::MarkAllSigned,
        Self::UpdateNegotiationState,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterConsent => "consent:register",
            Self::RejectConsentRequest => "consent:reject",
            Self::CancelConsent => "consent:cancel",
            Self::MarkAsErrored => "consent:mark-as-errored",
            Self::MarkAsUnique => "consent:mark-as-unique",
            Self::MarkCustodianChecked => "consent:mark-custodian-checked",
            Self::StartSync => "consent:start-sync",
            Self::MarkAsCompleted => "consent:mark-as-completed",
            Self::ReserveConsent => "treatment-relation:reserve-consent",
            Self::CreateNegotiation => "negotiation:create",
            Self::AddConsent => "negotiation:add-consent",
            Self::PrepareNegotiation => "negotiation:prepare",
            Self::ProposeConsent => "negotiation:propose-fact",
            Self::AddSignature => "negotiation:add-signature",
            Self::MarkAllSigned => "negotiation:mark-all-signed",
            Self::UpdateNegotiationState => "negotiation:update-state",
        }
    }

    /// The aggregate type this command routes to.
    pub const fn aggregate_type(&self) -> AggregateType {
        match self {
            Self::RegisterConsent
            | Self::RejectConsentRequest
            | Self::CancelConsent
            | Self::MarkAsErrored
            | Self::MarkAsUnique
            | Self::MarkCustodianChecked
            | Self::StartSync
            | Self::MarkAsCompleted => AggregateType::Consent,
            Self::ReserveConsent => AggregateType::TreatmentRelation,
            Self::CreateNegotiation
            | Self::AddConsent
            | Self::PrepareNegotiation
            | Self::ProposeConsent
            | Self::AddSignature
            | Self::MarkAllSigned
            | Self::UpdateNegotiationState => AggregateType::Negotiation,
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandKind {
    #[serde(rename = "consent:register")]
    RegisterConsent(ConsentData),
    #[serde(rename = "consent:reject")]
    RejectConsentRequest { reason: String },
    #[serde(rename = "consent:cancel")]
    CancelConsent { reason: String },
    #[serde(rename = "consent:mark-as-errored")]
    MarkAsErrored { reason: String },
    #[serde(rename = "consent:mark-as-unique")]
    MarkAsUnique,
    #[serde(rename = "consent:mark-custodian-checked")]
    MarkCustodianChecked,
    #[serde(rename = "consent:start-sync")]
    StartSync { sync_id: Uuid },
    #[serde(rename = "consent:mark-as-completed")]
    MarkAsCompleted,
    #[serde(rename = "treatment-relation:reserve-consent")]
    ReserveConsent(ConsentData),
    #[serde(rename = "negotiation:create")]
    CreateNegotiation {
        external_id: String,
        custodian_id: String,
        subject_id: String,
        actor_id: String,
    },
    #[serde(rename = "negotiation:add-consent")]
    AddConsent(ConsentData),
    #[serde(rename = "negotiation:prepare")]
    PrepareNegotiation,
    #[serde(rename = "negotiation:propose-fact")]
    ProposeConsent,
    #[serde(rename = "negotiation:add-signature")]
    AddSignature {
        consent_hash: String,
        party_id: String,
        signature: Vec<u8>,
    },
    #[serde(rename = "negotiation:mark-all-signed")]
    MarkAllSigned,
    #[serde(rename = "negotiation:update-state")]
    UpdateNegotiationState { state: NegotiationState },
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::RegisterConsent(_) => CommandType::RegisterConsent,
            Self::RejectConsentRequest { .. } => CommandType::RejectConsentRequest,
            Self::CancelConsent { .. } => CommandType::CancelConsent,
            Self::MarkAsErrored { .. } => CommandType::MarkAsErrored,
            Self::MarkAsUnique => CommandType::MarkAsUnique,
            Self::MarkCustodianChecked => CommandType::MarkCustodianChecked,
            Self::StartSync { .. } => CommandType::StartSync,
            Self::MarkAsCompleted => CommandType::MarkAsCompleted,
            Self::ReserveConsent(_) => CommandType::ReserveConsent,
            Self::CreateNegotiation { .. } => CommandType::CreateNegotiation,
            Self::AddConsent(_) => CommandType::AddConsent,
            Self::PrepareNegotiation => CommandType::PrepareNegotiation,
            Self::ProposeConsent => CommandType::ProposeConsent,
            Self::AddSignature { .. } => CommandType::AddSignature,
            Self::MarkAllSigned => CommandType::MarkAllSigned,
            Self::UpdateNegotiationState { .. } => CommandType::UpdateNegotiationState,
        }
    }
}

/// An instruction for one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub aggregate_id: Uuid,
    pub kind: CommandKind,
    /// Copied onto every event the command commits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event whose reaction produced this command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
}

impl Command {
    pub fn new(aggregate_id: Uuid, kind: CommandKind) -> Self {
        Self {
            aggregate_id,
            kind,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation(mut self, id: EventId) -> Self {
        self.causation_id = Some(id);
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }

    pub fn aggregate_type(&self) -> AggregateType {
        self.command_type().aggregate_type()
    }

    // Constructors used by the sagas and the intake.

    pub fn register_consent(data: ConsentData) -> Self {
        Self::new(data.id, CommandKind::RegisterConsent(data))
    }

    pub fn reject(consent_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(
            consent_id,
            CommandKind::RejectConsentRequest {
                reason: reason.into(),
            },
        )
    }

    pub fn cancel(consent_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(
            consent_id,
            CommandKind::CancelConsent {
                reason: reason.into(),
            },
        )
    }

    pub fn mark_as_errored(consent_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(
            consent_id,
            CommandKind::MarkAsErrored {
                reason: reason.into(),
            },
        )
    }
}
