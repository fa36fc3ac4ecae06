use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::Condition;
use crate::error::ConditionError;

/// Satisfied once every child condition is satisfied.
pub struct All {
    conditions: Vec<(Arc<dyn Condition>, AtomicBool)>,
}

/// Combines conditions, flattening nested `all` composites.
pub fn all(conditions: impl IntoIterator<Item = Arc<dyn Condition>>) -> Arc<dyn Condition> {
    let mut flat = Vec::new();
    for condition in conditions {
        match condition.parts() {
            Some(parts) => flat.extend(parts),
            None => flat.push(condition),
        }
    }

    Arc::new(All {
        conditions: flat
            .into_iter()
            .map(|c| (c, AtomicBool::new(false)))
            .collect(),
    })
}

impl fmt::Display for All {
    /// Lists only the children that have not been satisfied yet.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: Vec<String> = self
            .conditions
            .iter()
            .filter(|(_, done)| !done.load(Ordering::Acquire))
            .map(|(condition, _)| condition.to_string())
            .collect();
        f.write_str(&pending.join(", "))
    }
}

#[async_trait]
impl Condition for All {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        for (_, done) in &self.conditions {
            done.store(false, Ordering::Release);
        }

        let results = join_all(self.conditions.iter().map(|(condition, done)| async move {
            let result = condition.wait(ctx).await;
            if result.is_ok() {
                done.store(true, Ordering::Release);
            }
            result
        }))
        .await;

        let mut errors: Vec<ConditionError> =
            results.into_iter().filter_map(Result::err).collect();
        if errors.iter().any(ConditionError::is_cancelled) {
            return Err(ConditionError::Cancelled);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConditionError::Aggregate(errors)),
        }
    }

    fn parts(&self) -> Option<Vec<Arc<dyn Condition>>> {
        Some(
            self.conditions
                .iter()
                .map(|(condition, _)| Arc::clone(condition))
                .collect(),
        )
    }
}
