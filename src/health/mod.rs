//! Health tracking for services that expose a health check.

mod check;

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use check::{HealthCheck, Settings, health_check, run};

use crate::util::lock;

/// Last known health of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// `None` until the first check completes.
    pub healthy: Option<bool>,
    pub last_change: DateTime<Utc>,
    pub last_message: String,
}

/// Health flip delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub old: HealthStatus,
    pub new: HealthStatus,
}

#[derive(Default)]
struct Inner {
    status: HealthStatus,
    subscribers: Vec<mpsc::Sender<StateChange>>,
}

/// Thread-safe health status with change notification.
#[derive(Default)]
pub struct HealthState {
    inner: Mutex<Inner>,
}

impl HealthState {
    /// Resets the status to "unknown".
    pub fn init(&self) {
        let mut inner = lock(&self.inner);
        inner.status = HealthStatus {
            healthy: None,
            last_change: Utc::now(),
            last_message: "Unknown".to_string(),
        };
    }

    /// Records a check result. Subscribers are only told about flips of `healthy`.
    pub fn update(&self, healthy: bool, message: impl Into<String>) {
        let mut inner = lock(&self.inner);
        let old = inner.status.clone();

        let flipped = inner.status.healthy != Some(healthy);
        if flipped {
            inner.status.healthy = Some(healthy);
            inner.status.last_change = Utc::now();
        }
        inner.status.last_message = message.into();

        if !flipped {
            return;
        }

        let change = StateChange {
            old,
            new: inner.status.clone(),
        };
        let subscribers = inner.subscribers.clone();
        drop(inner);

        for subscriber in subscribers {
            // Slow subscribers lose notifications rather than blocking checks.
            let _ = subscriber.try_send(change.clone());
        }
    }

    pub fn get(&self) -> HealthStatus {
        lock(&self.inner).status.clone()
    }

    pub fn subscribe(&self, subscriber: mpsc::Sender<StateChange>) {
        lock(&self.inner).subscribers.push(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &mpsc::Sender<StateChange>) {
        lock(&self.inner)
            .subscribers
            .retain(|s| !s.same_channel(subscriber));
    }
}
