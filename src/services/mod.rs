//! Concrete [`Service`](crate::service::Service) implementations.

pub mod manifest;

pub use manifest::{HealthManifest, ManifestService, RestartMode, ServiceManifest};
