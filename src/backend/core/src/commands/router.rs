//! Command dispatch.
//!
//! The [`AggregateRuntime`] executes one command against one aggregate type:
//! load the stream, fold it, decide, append at the observed version and
//! publish what was committed. The [`CommandRouter`] maps every command type to
//! the runtime of its aggregate.
//!
//! Commands on one stream are decided one at a time and their batches reach
//! the bus in commit order. A saga reacting to a stream's event may command
//! the same stream again: that batch is queued and delivered by the caller
//! already draining the stream, right after the batch being delivered.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::instrument;

use super::{Command, CommandType};
use crate::aggregates::AggregateFactory;
use crate::config::RuntimeConfig;
use crate::error::{ConsentError, ErrorCode, Result};
use crate::events::{AggregateType, EventBus, EventEnvelope, EventMetadata, EventStore, StreamId};
use crate::telemetry::CommandMetrics;

/// Committed batches of one stream waiting for the bus.
#[derive(Default)]
struct Outbox {
    pending: VecDeque<Vec<EventEnvelope>>,
    draining: bool,
}

#[derive(Default)]
struct StreamSlot {
    write: tokio::sync::Mutex<()>,
    outbox: Mutex<Outbox>,
}

/// Clears the draining flag when the draining future is dropped midway, so
/// the next command on the stream picks up what is left.
struct DrainGuard<'a> {
    slot: &'a StreamSlot,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.slot.outbox.lock().draining = false;
        }
    }
}

pub struct AggregateRuntime {
    factory: Arc<dyn AggregateFactory>,
    store: Arc<dyn EventStore>,
    bus: Arc<EventBus>,
    config: RuntimeConfig,
    streams: DashMap<StreamId, Arc<StreamSlot>>,
}

impl AggregateRuntime {
    pub fn new(
        factory: Arc<dyn AggregateFactory>,
        store: Arc<dyn EventStore>,
        bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            factory,
            store,
            bus,
            config,
            streams: DashMap::new(),
        }
    }

    pub fn aggregate_type(&self) -> AggregateType {
        self.factory.aggregate_type()
    }

    /// Execute `command` and return the committed events.
    ///
    /// Events reach the bus only after they were appended. A command that
    /// produces no events commits nothing and publishes nothing.
    #[instrument(
        skip(self, command),
        fields(command_type = %command.command_type(), aggregate_id = %command.aggregate_id)
    )]
    pub async fn handle(&self, command: &Command) -> Result<Vec<EventEnvelope>> {
        let stream = StreamId::new(self.aggregate_type(), command.aggregate_id);
        let slot = self.slot(stream);

        let timer = CommandMetrics::start(command.command_type().as_str());
        let result = {
            let _write = slot.write.lock().await;
            let result = self.execute(stream, command).await;
            if let Ok(committed) = &result {
                if !committed.is_empty() {
                    slot.outbox.lock().pending.push_back(committed.clone());
                }
            }
            result
        };
        timer.finish(if result.is_ok() { "ok" } else { "error" });

        let committed = result?;
        if !committed.is_empty() {
            self.drain(&slot).await;
        }
        Ok(committed)
    }

    fn slot(&self, stream: StreamId) -> Arc<StreamSlot> {
        self.streams.entry(stream).or_default().clone()
    }

    /// Publish queued batches of one stream, oldest first.
    ///
    /// Only one caller drains a stream at a time; the others leave their batch
    /// in the queue for it.
    async fn drain(&self, slot: &StreamSlot) {
        {
            let mut outbox = slot.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        let mut guard = DrainGuard {
            slot,
            finished: false,
        };

        loop {
            let batch = {
                let mut outbox = slot.outbox.lock();
                let batch = outbox.pending.pop_front();
                if batch.is_none() {
                    // Cleared under the same lock a producer pushes under.
                    outbox.draining = false;
                }
                batch
            };
            match batch {
                Some(batch) => self.bus.publish(&batch).await,
                None => break,
            }
        }
        guard.finished = true;
    }

    async fn execute(&self, stream: StreamId, command: &Command) -> Result<Vec<EventEnvelope>> {
        let aggregate_type = stream.aggregate_type;
        let mut attempt = 0u32;

        loop {
            let history = self.store.load(&stream).await?;
            let mut aggregate = self.factory.create(command.aggregate_id);
            aggregate.replay(&history);

            let expected = aggregate.version();
            let events = aggregate.handle(command).await?;
            if events.is_empty() {
                tracing::debug!(version = expected, "Command produced no events");
                return Ok(Vec::new());
            }

            let envelopes: Vec<EventEnvelope> = events
                .into_iter()
                .enumerate()
                .map(|(i, event)| {
                    let mut metadata = EventMetadata::new(event.event_type(), stream, expected + i as u64 + 1);
                    metadata.correlation_id = command.correlation_id.clone();
                    metadata.causation_id = command.causation_id;
                    EventEnvelope::with_metadata(event, metadata)
                })
                .collect();

            match self.store.append(&stream, expected, envelopes.clone()).await {
                Ok(()) => {
                    CommandMetrics::appended(aggregate_type.as_str(), envelopes.len());
                    return Ok(envelopes);
                }
                Err(error)
                    if error.code() == ErrorCode::ConcurrencyConflict
                        && attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    CommandMetrics::conflict(aggregate_type.as_str());
                    tracing::debug!(attempt, expected, "Concurrency conflict, retrying command");
                    tokio::time::sleep(self.config.conflict_backoff * attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Routes commands to the runtime of their aggregate type.
#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<CommandType, Arc<AggregateRuntime>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one command type. Each type has at most one route.
    pub fn register(&mut self, command_type: CommandType, runtime: Arc<AggregateRuntime>) -> Result<()> {
        if command_type.aggregate_type() != runtime.aggregate_type() {
            return Err(ConsentError::new(
                ErrorCode::ConfigurationError,
                format!(
                    "command {} addresses {}, not {}",
                    command_type,
                    command_type.aggregate_type(),
                    runtime.aggregate_type()
                ),
            ));
        }
        if self.routes.contains_key(&command_type) {
            return Err(ConsentError::new(
                ErrorCode::ConfigurationError,
                format!("command {} is already routed", command_type),
            ));
        }
        self.routes.insert(command_type, runtime);
        Ok(())
    }

    /// Route every command type addressing the runtime's aggregate.
    pub fn register_aggregate(&mut self, runtime: Arc<AggregateRuntime>) -> Result<()> {
        let aggregate_type = runtime.aggregate_type();
        for command_type in CommandType::ALL
            .into_iter()
            .filter(|t| t.aggregate_type() == aggregate_type)
        {
            self.register(command_type, runtime.clone())?;
        }
        Ok(())
    }

    pub fn is_routed(&self, command_type: CommandType) -> bool {
        self.routes.contains_key(&command_type)
    }

    pub async fn handle(&self, command: &Command) -> Result<Vec<EventEnvelope>> {
        let runtime = self
            .routes
            .get(&command.command_type())
            .ok_or_else(|| ConsentError::no_handler(command.command_type()))?;
        runtime.handle(command).await
    }
}
