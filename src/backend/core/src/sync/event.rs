//! Bridge events and the channels they travel on.

use serde::{Deserialize, Serialize};

/// Lifecycle step a bridge event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    DistributedRequestReceived,
    RequestConstructed,
    RequestValid,
    RequestAcked,
    AttachmentSigned,
    AllSignaturesPresent,
    ConsentDistributed,
    Completed,
    Errored,
}

impl EventName {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DistributedRequestReceived => "distributed-request-received",
            Self::RequestConstructed => "request-constructed",
            Self::RequestValid => "request-valid",
            Self::RequestAcked => "request-acked",
            Self::AttachmentSigned => "attachment-signed",
            Self::AllSignaturesPresent => "all-signatures-present",
            Self::ConsentDistributed => "consent-distributed",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    ConsentRequest,
    ConsentRetry,
}

impl Channel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConsentRequest => "consent-request",
            Self::ConsentRetry => "consent-retry",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope of everything exchanged with the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEvent {
    /// Negotiation id
    pub uuid: String,
    pub name: EventName,
    /// Only set at the node that started the negotiation
    #[serde(default)]
    pub initiator_legal_entity: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub external_id: String,
    /// Base64 JSON of the bridge state
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeEvent {
    pub fn is_initiator(&self) -> bool {
        !self.initiator_legal_entity.is_empty()
    }

    /// Same event under a new name.
    pub fn renamed(&self, name: EventName) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }

    pub fn errored(&self, reason: impl Into<String>) -> Self {
        Self {
            name: EventName::Errored,
            error: Some(reason.into()),
            ..self.clone()
        }
    }

    /// Same name, error recorded, for the retry channel.
    pub fn for_retry(&self, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..self.clone()
        }
    }
}
