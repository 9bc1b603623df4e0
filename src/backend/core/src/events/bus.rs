//! In-process fan-out of committed events.
//!
//! Each event is delivered to every matching handler concurrently; the next
//! event of the batch is only delivered once all handlers of the previous one
//! returned, so batch order is preserved. Handler failures are reported on an
//! error channel and never undo the committed log entry.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::telemetry::BusMetrics;

use super::event::{EventEnvelope, EventId, EventType};

const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Interest predicate of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMatcher {
    Any,
    Types(Vec<EventType>),
}

impl EventMatcher {
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self::Types(types.into_iter().collect())
    }

    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::Any => true,
            Self::Types(types) => types.contains(&event_type),
        }
    }
}

/// Subscriber on the event bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn matcher(&self) -> EventMatcher;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// A handler that returned an error for a committed event.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_id: EventId,
    pub event_type: EventType,
    pub message: String,
}

pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    errors: broadcast::Sender<HandlerFailure>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            errors,
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), "Event handler subscribed");
        self.handlers.write().push(handler);
    }

    /// Receive handler failures published after this call.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<HandlerFailure> {
        self.errors.subscribe()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver a committed batch.
    pub async fn publish(&self, events: &[EventEnvelope]) {
        for envelope in events {
            let matching: Vec<Arc<dyn EventHandler>> = self
                .handlers
                .read()
                .iter()
                .filter(|h| h.matcher().matches(envelope.event_type()))
                .cloned()
                .collect();

            if matching.is_empty() {
                continue;
            }

            let results = join_all(matching.iter().map(|h| h.handle(envelope))).await;

            for (handler, result) in matching.iter().zip(results) {
                if let Err(error) = result {
                    self.report(handler.name(), envelope, error.to_string());
                }
            }
        }
    }

    fn report(&self, handler: &str, envelope: &EventEnvelope, message: String) {
        tracing::warn!(
            handler = handler,
            event_id = %envelope.id(),
            event_type = %envelope.event_type(),
            error = %message,
            "Event handler failed"
        );
        BusMetrics::handler_failed(handler);

        // No receivers is not an error: the warn line above is the fallback report.
        let _ = self.errors.send(HandlerFailure {
            handler: handler.to_string(),
            event_id: envelope.id(),
            event_type: envelope.event_type(),
            message,
        });
    }
}
