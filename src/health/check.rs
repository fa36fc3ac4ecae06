use std::{future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::HealthState;
use crate::{
    constants::{DEFAULT_HEALTH_INITIAL_DELAY, DEFAULT_HEALTH_PERIOD, DEFAULT_HEALTH_TIMEOUT},
    error::{BoxError, ConditionError},
    util,
};

/// A single health probe. The token is cancelled when the probe times out.
pub type HealthCheck =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`HealthCheck`].
pub fn health_check<F, Fut>(check: F) -> HealthCheck
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(check(ctx)))
}

/// Timing of the health loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub initial_delay: Duration,
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_HEALTH_INITIAL_DELAY,
            period: DEFAULT_HEALTH_PERIOD,
            timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

/// Runs `check` periodically until `ctx` is cancelled, feeding results into `state`.
/// Only ever returns [`ConditionError::Cancelled`].
pub async fn run(
    ctx: &CancellationToken,
    settings: &Settings,
    state: &HealthState,
    check: &HealthCheck,
) -> Result<(), ConditionError> {
    state.init();

    util::sleep(ctx, settings.initial_delay).await?;

    loop {
        let attempt = ctx.child_token();
        let result = match tokio::time::timeout(settings.timeout, check(attempt.clone())).await {
            Ok(result) => result,
            Err(_) => Err("health check timed out".into()),
        };
        attempt.cancel();

        if ctx.is_cancelled() {
            return Err(ConditionError::Cancelled);
        }

        match result {
            Ok(()) => state.update(true, ""),
            Err(err) => state.update(false, err.to_string()),
        }

        util::sleep(ctx, settings.period).await?;
    }
}
