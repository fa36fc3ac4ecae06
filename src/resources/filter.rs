use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{EventType, Metadata, Resource, ResourceStore};
use crate::error::StoreError;

/// Grants access to one resource type in one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub namespace: String,
    pub kind: String,
    /// Whether mutations are permitted.
    pub writable: bool,
}

impl FilterRule {
    pub fn read_only(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            writable: false,
        }
    }

    pub fn read_write(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            writable: true,
            ..Self::read_only(namespace, kind)
        }
    }
}

/// Store view that only exposes resources matched by its rules.
pub struct FilteredStore {
    inner: Arc<dyn ResourceStore>,
    rules: Vec<FilterRule>,
}

impl FilteredStore {
    pub fn new(inner: Arc<dyn ResourceStore>, rules: Vec<FilterRule>) -> Self {
        Self { inner, rules }
    }

    fn rule(&self, namespace: &str, kind: &str) -> Result<&FilterRule, StoreError> {
        self.rules
            .iter()
            .find(|r| r.namespace == namespace && r.kind == kind)
            .ok_or_else(|| StoreError::AccessDenied(format!("{namespace}/{kind}")))
    }

    fn check_read(&self, metadata: &Metadata) -> Result<(), StoreError> {
        self.rule(&metadata.namespace, &metadata.kind).map(|_| ())
    }

    fn check_write(&self, metadata: &Metadata) -> Result<(), StoreError> {
        if self.rule(&metadata.namespace, &metadata.kind)?.writable {
            Ok(())
        } else {
            Err(StoreError::ReadOnly(metadata.to_string()))
        }
    }
}

#[async_trait]
impl ResourceStore for FilteredStore {
    async fn create(&self, resource: Resource) -> Result<(), StoreError> {
        self.check_write(&resource.metadata)?;
        self.inner.create(resource).await
    }

    async fn get(&self, metadata: &Metadata) -> Result<Resource, StoreError> {
        self.check_read(metadata)?;
        self.inner.get(metadata).await
    }

    async fn list(&self, namespace: &str, kind: &str) -> Result<Vec<Resource>, StoreError> {
        self.rule(namespace, kind)?;
        self.inner.list(namespace, kind).await
    }

    async fn update(&self, resource: Resource) -> Result<(), StoreError> {
        self.check_write(&resource.metadata)?;
        self.inner.update(resource).await
    }

    async fn watch_for(
        &self,
        ctx: &CancellationToken,
        metadata: &Metadata,
        events: &[EventType],
    ) -> Result<Resource, StoreError> {
        self.check_read(metadata)?;
        self.inner.watch_for(ctx, metadata, events).await
    }

    async fn add_finalizer(&self, metadata: &Metadata, finalizer: &str) -> Result<(), StoreError> {
        self.check_write(metadata)?;
        self.inner.add_finalizer(metadata, finalizer).await
    }

    async fn remove_finalizer(
        &self,
        metadata: &Metadata,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.check_write(metadata)?;
        self.inner.remove_finalizer(metadata, finalizer).await
    }

    async fn destroy(&self, metadata: &Metadata) -> Result<(), StoreError> {
        self.check_write(metadata)?;
        self.inner.destroy(metadata).await
    }
}
