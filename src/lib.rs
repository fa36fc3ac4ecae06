//! Nodevisor supervises the system services of an immutable Linux node. Services
//! declare what they wait for (other services, files, volumes), how they run (host
//! processes, containers, in-process tasks) and how their health is checked; the
//! supervisor starts them once their conditions hold, restarts them per policy and
//! stops them in reverse dependency order.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Tunable timings and well-known paths.
pub mod constants;

/// Error handling.
pub mod error;

/// Service lifecycle states and the event bus.
pub mod events;

/// Health checks and health state tracking.
pub mod health;

/// Awaitable preconditions.
pub mod conditions;

/// Service log sinks and tracing setup.
pub mod logging;

/// Zombie reaping for PID 1 and subreaper deployments.
pub mod reaper;

/// Typed resource store and volume mount requests.
pub mod resources;

/// Execution strategies: processes, containers, tasks and restart wrappers.
pub mod runner;

/// Runtime environment handed to services.
pub mod runtime;

/// Process sandboxing applied before `exec`.
pub mod sandbox;

/// The service contract.
pub mod service;

/// Per-service lifecycle driver.
pub mod service_runner;

/// Service implementations built from configuration.
pub mod services;

/// Service registry, dependency-ordered start and shutdown.
pub mod supervisor;

pub(crate) mod util;

#[cfg(test)]
pub mod test_utils;
