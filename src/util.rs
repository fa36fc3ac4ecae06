//! Small helpers shared by the async machinery.
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::error::ConditionError;

/// Locks a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleeps for `duration` unless `ctx` is cancelled first.
pub(crate) async fn sleep(
    ctx: &CancellationToken,
    duration: Duration,
) -> Result<(), ConditionError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(ConditionError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
