//! Composable, human-describable waits.
//!
//! A [`Condition`] blocks until something on the node becomes true (a file exists, a
//! dependency is up, a volume is mounted). Its [`Display`](std::fmt::Display) output is
//! what operators see in `Waiting for ...` events, so composites re-render it with
//! only the parts that are still pending.

mod all;
mod file;
mod kubeconfig;
mod poll;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use all::{All, all};
pub use file::{FileExists, wait_for_file_to_exist, wait_for_files_to_exist};
pub use kubeconfig::{KubeconfigReady, wait_for_kubeconfig_ready};
pub use poll::{Assertion, PollingCondition, SkipAssertion, assertion, poll};

use crate::error::ConditionError;

#[async_trait]
pub trait Condition: fmt::Display + Send + Sync {
    /// Blocks until the condition holds or `ctx` is cancelled.
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError>;

    /// Children of a composite condition, used to flatten nested composites.
    fn parts(&self) -> Option<Vec<Arc<dyn Condition>>> {
        None
    }
}

struct Nothing;

impl fmt::Display for Nothing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("nothing")
    }
}

#[async_trait]
impl Condition for Nothing {
    async fn wait(&self, _ctx: &CancellationToken) -> Result<(), ConditionError> {
        Ok(())
    }
}

/// A condition that is always satisfied.
pub fn none() -> Arc<dyn Condition> {
    Arc::new(Nothing)
}
