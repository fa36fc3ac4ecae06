//! # Restart policy for runners.
//!
//! [`RestartRunner`] wraps another runner and re-runs it after it exits:
//!
//! - [`RestartPolicy::Once`] never restarts; the inner result is returned as is.
//! - [`RestartPolicy::UntilSuccess`] restarts after failures and returns on the first success.
//! - [`RestartPolicy::Forever`] restarts after every exit until stopped.
//!
//! Each restart is announced with a `Waiting` event and delayed by the restart interval.
//! Stopping the wrapper stops the in-flight cycle and returns that cycle's result;
//! stopping during the delay returns `Ok`.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{CycleControl, Runner};
use crate::{
    constants::DEFAULT_RESTART_INTERVAL,
    error::RunnerError,
    events::{Recorder, ServiceState},
};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum RestartPolicy {
    #[default]
    Forever,
    Once,
    UntilSuccess,
}

pub struct RestartRunner {
    inner: Arc<dyn Runner>,
    policy: RestartPolicy,
    interval: Duration,
    cycle: CycleControl,
}

impl RestartRunner {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self {
            inner,
            policy: RestartPolicy::default(),
            interval: DEFAULT_RESTART_INTERVAL,
            cycle: CycleControl::default(),
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Wraps `inner` with the default policy.
pub fn restart(inner: impl Runner + 'static) -> RestartRunner {
    RestartRunner::new(Arc::new(inner))
}

impl fmt::Display for RestartRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Restart({}, {})", self.inner, self.policy)
    }
}

#[async_trait]
impl Runner for RestartRunner {
    async fn open(&self) -> Result<(), RunnerError> {
        self.inner.open().await
    }

    async fn run(&self, recorder: Recorder) -> Result<(), RunnerError> {
        let (cycle, _guard) = self.cycle.begin();

        loop {
            let run = self.inner.run(Arc::clone(&recorder));
            tokio::pin!(run);

            let outcome = tokio::select! {
                result = &mut run => Some(result),
                _ = cycle.stop.cancelled() => None,
            };

            let Some(result) = outcome else {
                let (stopped, result) = tokio::join!(self.inner.stop(), &mut run);
                stopped?;
                return result;
            };

            // Re-arm the inner runner for the next cycle.
            self.inner.stop().await?;

            let message = match (self.policy, &result) {
                (RestartPolicy::Once, _) | (RestartPolicy::UntilSuccess, Ok(())) => None,
                (RestartPolicy::UntilSuccess, Err(err)) => Some(format!(
                    "Error running {}, going to restart until it succeeds: {err}",
                    self.inner
                )),
                (RestartPolicy::Forever, Ok(())) => {
                    Some("Service exited without error, going to restart".to_string())
                }
                (RestartPolicy::Forever, Err(err)) => Some(format!(
                    "Error running {}, going to restart forever: {err}",
                    self.inner
                )),
            };
            let Some(message) = message else {
                return result;
            };
            recorder(ServiceState::Waiting, message);

            tokio::select! {
                _ = cycle.stop.cancelled() => {
                    recorder(ServiceState::Stopping, "Aborting restart sequence".to_string());
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        self.cycle.stop().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RunnerError> {
        self.inner.close().await
    }
}
