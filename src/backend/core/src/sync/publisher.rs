//! Bridge/message-bus collaborator.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::event::{BridgeEvent, Channel, EventName};
use crate::error::{ConsentError, Result};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Name this node publishes under.
    fn name(&self) -> &str;

    async fn publish(&self, channel: Channel, event: BridgeEvent) -> Result<()>;
}

/// Publisher that records every event instead of sending it.
///
/// It stands in for the bridge in a single node deployment and in tests.
pub struct InMemoryBridge {
    name: String,
    available: AtomicBool,
    published: Mutex<Vec<(Channel, BridgeEvent)>>,
}

impl InMemoryBridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        }
    }

    /// When unavailable, `publish` fails with a recoverable transport error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(Channel, BridgeEvent)> {
        self.published.lock().clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<(Channel, BridgeEvent)> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn published_named(&self, name: EventName) -> Vec<BridgeEvent> {
        self.published
            .lock()
            .iter()
            .filter(|(_, e)| e.name == name)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, channel: Channel, event: BridgeEvent) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ConsentError::transport_recoverable("bridge unavailable"));
        }
        tracing::debug!(
            publisher = %self.name,
            channel = %channel,
            name = %event.name,
            uuid = %event.uuid,
            "Bridge event published"
        );
        self.published.lock().push((channel, event));
        Ok(())
    }
}
