//! Runtime-wide broadcast of service events.
//!
//! [`EventBus`] wraps [`tokio::sync::broadcast`]; every state change recorded by a
//! service runner is published here so observers can follow the whole node.

use serde::Serialize;
use tokio::sync::broadcast;

use super::ServiceEvent;
use crate::constants::EVENT_BUS_CAPACITY;

/// Event published on the bus, tagged with the service it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEventMessage {
    pub id: String,
    pub event: ServiceEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEventMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event; it is dropped when nobody listens.
    pub fn publish(&self, message: ServiceEventMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEventMessage> {
        self.tx.subscribe()
    }
}
