//! Typed resource store used to coordinate with other node controllers.
//!
//! Services never mount volumes themselves: they publish a volume mount request
//! into the store and wait for the matching status to show up. The store only has
//! to provide create/get/watch/destroy plus finalizers, so tests run against
//! [`MemoryStore`] and callers can restrict access with [`FilteredStore`].

mod filter;
mod memory;
pub mod volume;

use std::{collections::BTreeSet, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

pub use filter::{FilterRule, FilteredStore};
pub use memory::MemoryStore;

use crate::error::StoreError;

/// Identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl Metadata {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub metadata: Metadata,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub finalizers: BTreeSet<String>,
    pub spec: serde_json::Value,
}

impl Resource {
    pub fn new<S: Serialize>(metadata: Metadata, spec: &S) -> Result<Self, StoreError> {
        Ok(Self {
            metadata,
            version: 0,
            finalizers: BTreeSet::new(),
            spec: serde_json::to_value(spec)?,
        })
    }

    pub fn spec<S: DeserializeOwned>(&self) -> Result<S, StoreError> {
        Ok(serde_json::from_value(self.spec.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum EventType {
    Created,
    Updated,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub resource: Resource,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn create(&self, resource: Resource) -> Result<(), StoreError>;

    async fn get(&self, metadata: &Metadata) -> Result<Resource, StoreError>;

    async fn list(&self, namespace: &str, kind: &str) -> Result<Vec<Resource>, StoreError>;

    /// Replaces the spec of an existing resource.
    async fn update(&self, resource: Resource) -> Result<(), StoreError>;

    /// Resolves with the resource once it matches one of `events`. An existing
    /// resource counts as `Created`.
    async fn watch_for(
        &self,
        ctx: &CancellationToken,
        metadata: &Metadata,
        events: &[EventType],
    ) -> Result<Resource, StoreError>;

    async fn add_finalizer(&self, metadata: &Metadata, finalizer: &str) -> Result<(), StoreError>;

    async fn remove_finalizer(
        &self,
        metadata: &Metadata,
        finalizer: &str,
    ) -> Result<(), StoreError>;

    /// Removes a resource; fails while finalizers are attached.
    async fn destroy(&self, metadata: &Metadata) -> Result<(), StoreError>;
}
