//! Checks that the custodian of a unique request is a known, key-bearing party.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::Saga;
use crate::commands::{Command, CommandKind};
use crate::error::Result;
use crate::events::{DomainEvent, EventEnvelope, EventMatcher, EventType};
use crate::registry::Registry;

const UNKNOWN_CUSTODIAN: &str = "custodian is not a valid or known party";

pub struct CheckPartiesSaga {
    registry: Arc<dyn Registry>,
}

impl CheckPartiesSaga {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Saga for CheckPartiesSaga {
    fn name(&self) -> &str {
        "check-parties"
    }

    fn matcher(&self) -> EventMatcher {
        EventMatcher::types([EventType::ConsentMarkedUnique])
    }

    async fn react(&self, envelope: &EventEnvelope) -> Result<Vec<Command>> {
        let DomainEvent::ConsentMarkedUnique(data) = &envelope.event else {
            return Ok(Vec::new());
        };

        let known = match self.registry.organization_by_id(&data.custodian_id).await {
            Ok(organization) => organization.current_public_key(Utc::now()).is_some(),
            // An unreachable registry says nothing about the party; let the bus report it.
            Err(e) if e.is_retryable() => return Err(e),
            Err(_) => false,
        };

        if known {
            Ok(vec![Command::new(data.id, CommandKind::MarkCustodianChecked)])
        } else {
            Ok(vec![Command::mark_as_errored(data.id, UNKNOWN_CUSTODIAN)])
        }
    }
}
