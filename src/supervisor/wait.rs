use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Registry, Supervisor};
use crate::{conditions::Condition, error::ConditionError, service_runner::StateEvent};

/// Holds once a loaded service reaches a [`StateEvent`].
pub struct ServiceStateCondition {
    registry: Weak<Registry>,
    event: StateEvent,
    service: String,
}

/// Waits for service `id` of `supervisor` to reach `event`.
pub fn wait_for_service(
    supervisor: &Supervisor,
    event: StateEvent,
    id: impl Into<String>,
) -> Arc<dyn Condition> {
    wait_for_service_in(Arc::downgrade(&supervisor.inner), event, id)
}

pub(crate) fn wait_for_service_in(
    registry: Weak<Registry>,
    event: StateEvent,
    id: impl Into<String>,
) -> Arc<dyn Condition> {
    Arc::new(ServiceStateCondition {
        registry,
        event,
        service: id.into(),
    })
}

impl fmt::Display for ServiceStateCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service {:?} to be {:?}",
            self.service,
            self.event.to_string()
        )
    }
}

#[async_trait]
impl Condition for ServiceStateCondition {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        let runner = self
            .registry
            .upgrade()
            .and_then(|registry| registry.runner(&self.service))
            .ok_or_else(|| ConditionError::ServiceNotRegistered(self.service.clone()))?;

        let (tx, mut rx) = mpsc::channel(1);
        runner.subscribe(self.event, tx.clone());

        let result = tokio::select! {
            _ = rx.recv() => Ok(()),
            _ = ctx.cancelled() => Err(ConditionError::Cancelled),
        };

        runner.unsubscribe(self.event, &tx);
        result
    }
}
