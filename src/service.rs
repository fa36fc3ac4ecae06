//! The service descriptor the supervisor drives.
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    conditions::Condition,
    error::BoxError,
    events::ServiceState,
    health::{HealthCheck, Settings},
    runner::Runner,
    runtime::Runtime,
};

/// A long-lived subsystem managed by the supervisor.
///
/// Only [`Service::id`] and [`Service::runner`] are required; everything else
/// has a neutral default. A service is immutable while it is loaded.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Stable identifier, unique within the supervisor.
    fn id(&self, runtime: &Runtime) -> String;

    /// Runs after the start condition holds and before the runner is built.
    async fn pre_func(&self, _ctx: &CancellationToken, _runtime: &Runtime) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs once the runner has finished, with the state it finished in.
    async fn post_func(&self, _runtime: &Runtime, _state: ServiceState) -> Result<(), BoxError> {
        Ok(())
    }

    /// Extra condition to hold before the service is prepared.
    fn condition(&self, _runtime: &Runtime) -> Option<Arc<dyn Condition>> {
        None
    }

    /// Ids of services that must be up first.
    fn depends_on(&self, _runtime: &Runtime) -> Vec<String> {
        Vec::new()
    }

    /// Ids of volumes that must be mounted first.
    fn volumes(&self, _runtime: &Runtime) -> Vec<String> {
        Vec::new()
    }

    /// Builds the runner; `None` means there is nothing to run and the service is skipped.
    fn runner(&self, runtime: &Arc<Runtime>) -> Result<Option<Box<dyn Runner>>, BoxError>;

    fn healthcheck(&self) -> Option<&dyn HealthcheckedService> {
        None
    }

    fn api_start_allowed(&self, _runtime: &Runtime) -> bool {
        false
    }

    fn api_stop_allowed(&self, _runtime: &Runtime) -> bool {
        false
    }

    fn api_restart_allowed(&self, _runtime: &Runtime) -> bool {
        false
    }
}

/// Services that report health while running.
pub trait HealthcheckedService: Send + Sync {
    fn health_func(&self, runtime: &Runtime) -> HealthCheck;

    fn health_settings(&self, runtime: &Runtime) -> Settings;
}
