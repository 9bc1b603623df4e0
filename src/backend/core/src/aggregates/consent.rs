//! Consent aggregate: one custodian/subject/actor/class/period request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Aggregate, AggregateFactory};
use crate::commands::{Command, CommandKind};
use crate::error::{ConsentError, Result};
use crate::events::{AggregateType, ConsentData, DomainEvent};

/// Lifecycle of a consent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    #[default]
    Pending,
    Completed,
    Errored,
    Canceled,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
        }
    }

    /// Final statuses accept no further commands.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsentAggregate {
    id: Uuid,
    version: u64,
    status: ConsentStatus,
    data: Option<ConsentData>,
    unique: bool,
    custodian_checked: bool,
    sync_id: Option<Uuid>,
    reason: Option<String>,
}

impl ConsentAggregate {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            status: ConsentStatus::Pending,
            data: None,
            unique: false,
            custodian_checked: false,
            sync_id: None,
            reason: None,
        }
    }

    pub fn status(&self) -> ConsentStatus {
        self.status
    }

    pub fn data(&self) -> Option<&ConsentData> {
        self.data.as_ref()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_custodian_checked(&self) -> bool {
        self.custodian_checked
    }

    pub fn sync_id(&self) -> Option<Uuid> {
        self.sync_id
    }

    /// Reason recorded by the last rejection, cancellation or error.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    fn registered(&self) -> Result<ConsentData> {
        self.data
            .clone()
            .ok_or_else(|| ConsentError::aggregate_not_found(AggregateType::Consent, self.id))
    }
}

#[async_trait]
impl Aggregate for ConsentAggregate {
    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Consent
    }

    fn version(&self) -> u64 {
        self.version
    }

    async fn handle(&self, command: &Command) -> Result<Vec<DomainEvent>> {
        match self.status {
            ConsentStatus::Pending => {}
            ConsentStatus::Canceled => return Err(ConsentError::aggregate_cancelled(self.id)),
            status => return Err(ConsentError::aggregate_closed(self.id, status)),
        }

        let event = match &command.kind {
            CommandKind::RegisterConsent(data) => DomainEvent::ConsentRequestRegistered(data.clone()),
            CommandKind::RejectConsentRequest { reason } => DomainEvent::ConsentRequestRejected {
                reason: reason.clone(),
            },
            CommandKind::CancelConsent { reason } => DomainEvent::ConsentCanceled {
                reason: reason.clone(),
            },
            CommandKind::MarkAsErrored { reason } => DomainEvent::ConsentErrored {
                reason: reason.clone(),
            },
            CommandKind::MarkAsUnique => DomainEvent::ConsentMarkedUnique(self.registered()?),
            CommandKind::MarkCustodianChecked => DomainEvent::CustodianChecked(self.registered()?),
            CommandKind::StartSync { sync_id } => DomainEvent::SyncStarted { sync_id: *sync_id },
            CommandKind::MarkAsCompleted => DomainEvent::ConsentCompleted,
            other => return Err(ConsentError::unknown_command(other.command_type())),
        };

        Ok(vec![event])
    }

    fn apply(&mut self, event: &DomainEvent) {
        match event {
            DomainEvent::ConsentRequestRegistered(data) => {
                self.data = Some(data.clone());
                self.status = ConsentStatus::Pending;
            }
            DomainEvent::ConsentRequestRejected { reason } | DomainEvent::ConsentErrored { reason } => {
                self.status = ConsentStatus::Errored;
                self.reason = Some(reason.clone());
            }
            DomainEvent::ConsentCanceled { reason } => {
                self.status = ConsentStatus::Canceled;
                self.reason = Some(reason.clone());
            }
            DomainEvent::ConsentMarkedUnique(_) => self.unique = true,
            DomainEvent::CustodianChecked(_) => self.custodian_checked = true,
            DomainEvent::SyncStarted { sync_id } => self.sync_id = Some(*sync_id),
            DomainEvent::ConsentCompleted => self.status = ConsentStatus::Completed,
            _ => {}
        }
        self.version += 1;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsentAggregateFactory;

impl AggregateFactory for ConsentAggregateFactory {
    fn aggregate_type(&self) -> AggregateType {
        AggregateType::Consent
    }

    fn create(&self, id: Uuid) -> Box<dyn Aggregate> {
        Box::new(ConsentAggregate::new(id))
    }
}
