//! Runtime environment handed to every service.
use std::{env, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    events::EventBus,
    logging::{LoggingManager, NullLoggingManager},
    resources::{MemoryStore, ResourceStore},
};

/// Where logs live when the configuration does not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// User home dir (~/.local/share/nodevisor).
    User,
    /// System dirs (/var/log/nodevisor).
    System,
}

impl RuntimeMode {
    /// System mode when running as root.
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            RuntimeMode::System
        } else {
            RuntimeMode::User
        }
    }

    pub fn log_dir(self) -> PathBuf {
        match self {
            RuntimeMode::System => PathBuf::from("/var/log/nodevisor"),
            RuntimeMode::User => env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/"))
                .join(".local/share/nodevisor/logs"),
        }
    }
}

/// Role of the node; services consult it to decide whether they apply.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MachineType {
    #[default]
    Unknown,
    Init,
    ControlPlane,
    Worker,
}

impl MachineType {
    pub fn is_control_plane(self) -> bool {
        matches!(self, MachineType::Init | MachineType::ControlPlane)
    }
}

/// Node facts services read while building runners.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Mirror service output to the console.
    pub debug: bool,
    pub machine_type: MachineType,
    /// Running inside a container; volume requests are skipped.
    pub in_container: bool,
    /// `KEY=value` pairs appended to every process environment.
    pub environment: Vec<String>,
}

/// Shared services: configuration, log sinks, resource state and the event bus.
#[derive(Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    logging: Arc<dyn LoggingManager>,
    state: Arc<dyn ResourceStore>,
    events: Option<EventBus>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            logging: Arc::new(NullLoggingManager),
            state: Arc::new(MemoryStore::new()),
            events: None,
        }
    }

    pub fn with_logging(mut self, logging: Arc<dyn LoggingManager>) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_state(mut self, state: Arc<dyn ResourceStore>) -> Self {
        self.state = state;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn logging(&self) -> &Arc<dyn LoggingManager> {
        &self.logging
    }

    pub fn state(&self) -> &Arc<dyn ResourceStore> {
        &self.state
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.events.as_ref()
    }
}
