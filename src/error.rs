//! Error handling for nodevisor.
use std::{io, path::PathBuf};

use thiserror::Error;

/// Boxed error returned by caller-supplied hooks, health checks and task bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Operations that can be requested for a single service through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ApiOperation {
    Start,
    Stop,
    Restart,
}

/// Errors surfaced by the service registry.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The requested id is not loaded.
    #[error("service {0:?} not found")]
    UnknownService(String),

    /// The service does not permit the operation via the API.
    #[error("service {service:?} doesn't support {operation} operation via API")]
    NotAllowed {
        /// Service the request targeted.
        service: String,
        /// Requested operation.
        operation: ApiOperation,
    },

    /// Waiting for services to go down failed.
    #[error("failed waiting for services: {0}")]
    Condition(#[from] ConditionError),

    /// Shutdown ran past its deadline.
    #[error("timed out waiting for services to stop")]
    Timeout,

    /// Cleaning up volume mount requests failed.
    #[error("failed to release volumes of {service:?}: {source}")]
    Volumes {
        /// Service being unloaded.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: StoreError,
    },

    /// Several independent failures.
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<SupervisorError>),
}

/// Errors terminating a single service lifecycle. The messages double as the
/// text of the `Failed` event.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Condition failed: {0}")]
    Condition(#[source] ConditionError),

    #[error("Failed to create volume mount request: {0}")]
    VolumeRequest(#[source] StoreError),

    #[error("Failed to run pre stage: {0}")]
    PreStage(#[source] BoxError),

    #[error("Failed to create runner: {0}")]
    CreateRunner(#[source] BoxError),

    #[error("Failed running service: error opening runner: {0}")]
    Open(#[source] RunnerError),

    #[error("Failed running service: error running service: {0}")]
    Run(#[source] RunnerError),

    #[error("Failed running service: error stopping service: {0}")]
    Stop(#[source] RunnerError),

    #[error("Failed to run post stage: {0}")]
    PostStage(#[source] BoxError),
}

/// Errors produced by runners.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// No arguments to execute.
    #[error("no command given for {id:?}")]
    EmptyCommand { id: String },

    #[error("failed to open log for {id:?}: {source}")]
    Log {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare {id:?}: {source}")]
    Setup {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {id:?}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for {id:?}: {source}")]
    Wait {
        id: String,
        #[source]
        source: io::Error,
    },

    /// The process terminated unsuccessfully.
    #[error("{id:?} {status}")]
    Exit { id: String, status: String },

    #[error("failed to signal {id:?}: {source}")]
    Signal {
        id: String,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("task {id:?} failed: {source}")]
    Task {
        id: String,
        #[source]
        source: BoxError,
    },

    /// The task body panicked; `stack` holds a truncated backtrace.
    #[error("panic in {id:?}: {message}\n{stack}")]
    Panic {
        id: String,
        message: String,
        stack: String,
    },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("{0}")]
    Other(String),
}

impl RunnerError {
    /// Free-form runner error.
    pub fn other(message: impl Into<String>) -> Self {
        RunnerError::Other(message.into())
    }
}

/// Errors returned by the container runtime client.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The object does not exist; cleanup paths treat this as success.
    #[error("{0}: not found")]
    NotFound(String),

    #[error("failed to connect to container runtime at {address:?}: {message}")]
    Connect { address: PathBuf, message: String },

    #[error("task {id:?} exited with code {code}")]
    ExitCode { id: String, code: u32 },

    #[error("runner for {0:?} is not open")]
    NotOpen(String),

    #[error("timed out {0}")]
    Timeout(String),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound(_))
    }
}

/// Errors returned while waiting on conditions.
#[derive(Debug, Error)]
pub enum ConditionError {
    /// The wait was cancelled by its context.
    #[error("context canceled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("service {0:?} is not registered")]
    ServiceNotRegistered(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ConditionError>),
}

impl ConditionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConditionError::Cancelled)
    }
}

/// Errors returned by the resource store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {0} doesn't exist")]
    NotFound(String),

    #[error("resource {0} already exists")]
    AlreadyExists(String),

    #[error("resource {0} has pending finalizers")]
    PendingFinalizers(String),

    #[error("access to {0} is not allowed")]
    AccessDenied(String),

    #[error("access to {0} is read-only")]
    ReadOnly(String),

    #[error("watch cancelled")]
    Cancelled,

    #[error("invalid resource spec: {0}")]
    Spec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Errors loading the supervisor configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference could not be resolved.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid variable pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid duration value: '{0}'")]
    Duration(String),

    /// A service entry is malformed.
    #[error("Service '{service}' is invalid: {reason}")]
    InvalidService { service: String, reason: String },
}

fn join_errors<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
