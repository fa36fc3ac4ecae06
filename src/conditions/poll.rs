use std::{fmt, future::Future, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::Condition;
use crate::{
    error::{BoxError, ConditionError},
    util::{self, lock},
};

/// Returned by an assertion to satisfy the condition without it actually holding.
#[derive(Debug, Error)]
#[error("condition is skipped")]
pub struct SkipAssertion;

/// One attempt of a polled check; the token is cancelled after one interval.
pub type Assertion =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

pub fn assertion<F, Fut>(f: F) -> Assertion
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[derive(Debug, Clone)]
enum Status {
    Pending,
    Satisfied,
    Skipped,
    Failing(String),
}

/// Repeats an assertion until it passes, describing itself with the last result.
pub struct PollingCondition {
    description: String,
    assertion: Assertion,
    interval: Duration,
    status: Mutex<Status>,
}

pub fn poll(
    description: impl Into<String>,
    assertion: Assertion,
    interval: Duration,
) -> Arc<dyn Condition> {
    Arc::new(PollingCondition::new(description, assertion, interval))
}

impl PollingCondition {
    pub fn new(description: impl Into<String>, assertion: Assertion, interval: Duration) -> Self {
        Self {
            description: description.into(),
            assertion,
            interval,
            status: Mutex::new(Status::Pending),
        }
    }

    fn set(&self, status: Status) {
        *lock(&self.status) = status;
    }
}

impl fmt::Display for PollingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*lock(&self.status) {
            Status::Pending => write!(f, "{}: ...", self.description),
            Status::Satisfied => write!(f, "{}: OK", self.description),
            Status::Skipped => write!(f, "{}: SKIP", self.description),
            Status::Failing(err) => write!(f, "{}: {}", self.description, err),
        }
    }
}

#[async_trait]
impl Condition for PollingCondition {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        loop {
            let attempt = ctx.child_token();
            let outcome =
                tokio::time::timeout(self.interval, (self.assertion)(attempt.clone())).await;
            attempt.cancel();

            match outcome {
                Ok(Ok(())) => {
                    self.set(Status::Satisfied);
                    return Ok(());
                }
                Ok(Err(err)) if err.downcast_ref::<SkipAssertion>().is_some() => {
                    self.set(Status::Skipped);
                    return Ok(());
                }
                Ok(Err(err)) => self.set(Status::Failing(err.to_string())),
                Err(_) => self.set(Status::Failing("timed out".to_string())),
            }

            util::sleep(ctx, self.interval).await?;
        }
    }
}
