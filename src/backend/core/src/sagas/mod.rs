//! Sagas - process managers reacting to committed events with follow-up commands.
//!
//! A saga only decides; the [`SagaHandler`] subscribes it to the event bus and
//! dispatches what it returns through the command router, in order, stopping
//! at the first failure.

pub mod check_parties;
pub mod consent_progress;
pub mod uniqueness;

pub use check_parties::CheckPartiesSaga;
pub use consent_progress::ConsentProgressManager;
pub use uniqueness::{InMemoryUniquenessProjection, UniquenessKey, UniquenessProjection, UniquenessSaga};

use async_trait::async_trait;
use std::sync::{Arc, Weak};

use crate::commands::{Command, CommandRouter};
use crate::error::{ConsentError, Result};
use crate::events::{EventEnvelope, EventHandler, EventMatcher};
use crate::telemetry::BusMetrics;

#[async_trait]
pub trait Saga: Send + Sync {
    fn name(&self) -> &str;

    /// Event types this saga reacts to.
    fn matcher(&self) -> EventMatcher;

    /// Commands to dispatch in reaction to one committed event.
    async fn react(&self, envelope: &EventEnvelope) -> Result<Vec<Command>>;
}

/// Event bus subscription of one saga.
///
/// Holds the router weakly: the router owns the runtimes, the runtimes own the
/// bus and the bus owns this handler.
pub struct SagaHandler {
    saga: Arc<dyn Saga>,
    router: Weak<CommandRouter>,
}

impl SagaHandler {
    pub fn new(saga: Arc<dyn Saga>, router: &Arc<CommandRouter>) -> Self {
        Self {
            saga,
            router: Arc::downgrade(router),
        }
    }
}

#[async_trait]
impl EventHandler for SagaHandler {
    fn name(&self) -> &str {
        self.saga.name()
    }

    fn matcher(&self) -> EventMatcher {
        self.saga.matcher()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let commands = self.saga.react(envelope).await?;
        if commands.is_empty() {
            return Ok(());
        }

        let router = self
            .router
            .upgrade()
            .ok_or_else(|| ConsentError::internal("command router is gone"))?;
        BusMetrics::saga_commands(self.saga.name(), commands.len());

        for mut command in commands {
            if command.correlation_id.is_none() {
                command.correlation_id = envelope.metadata.correlation_id.clone();
            }
            let command = command.with_causation(envelope.id());

            tracing::debug!(
                saga = self.saga.name(),
                command_type = %command.command_type(),
                aggregate_id = %command.aggregate_id,
                caused_by = %envelope.event_type(),
                "Saga dispatching command"
            );
            router.handle(&command).await?;
        }
        Ok(())
    }
}
