//! Service lifecycle states and the events recorded for them.

mod bus;
mod ring;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use bus::{EventBus, ServiceEventMessage};
pub use ring::ServiceEvents;

use crate::health::HealthStatus;

/// Lifecycle state of a supervised service.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::AsRefStr,
    strum_macros::EnumString,
)]
pub enum ServiceState {
    #[default]
    Initialized,
    Preparing,
    Waiting,
    Running,
    Stopping,
    Finished,
    Failed,
    Skipped,
}

impl ServiceState {
    /// Whether the service reached a terminal state.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            ServiceState::Finished | ServiceState::Failed | ServiceState::Skipped
        )
    }
}

/// A single recorded state transition or health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub message: String,
    pub state: ServiceState,
    /// Health snapshot, present only on events produced by health changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(state: ServiceState, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state,
            health: None,
            timestamp: Utc::now(),
        }
    }
}

/// Callback runners use to report state changes back to their owner.
pub type Recorder = Arc<dyn Fn(ServiceState, String) + Send + Sync>;

/// Recorder that drops every event.
pub fn null_recorder() -> Recorder {
    Arc::new(|_, _| {})
}
