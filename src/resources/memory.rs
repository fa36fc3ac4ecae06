use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{EventType, Metadata, Resource, ResourceStore, WatchEvent};
use crate::{error::StoreError, util::lock};

const WATCH_CAPACITY: usize = 256;

/// Process-local resource store.
pub struct MemoryStore {
    resources: Mutex<HashMap<Metadata, Resource>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            resources: Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event_type: EventType, resource: Resource) {
        let _ = self.events.send(WatchEvent {
            event_type,
            resource,
        });
    }

    fn modify<F>(&self, metadata: &Metadata, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Resource) -> bool,
    {
        let updated = {
            let mut resources = lock(&self.resources);
            let resource = resources
                .get_mut(metadata)
                .ok_or_else(|| StoreError::NotFound(metadata.to_string()))?;
            if !f(resource) {
                return Ok(());
            }
            resource.version += 1;
            resource.clone()
        };
        self.emit(EventType::Updated, updated);
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(&self, mut resource: Resource) -> Result<(), StoreError> {
        {
            let mut resources = lock(&self.resources);
            if resources.contains_key(&resource.metadata) {
                return Err(StoreError::AlreadyExists(resource.metadata.to_string()));
            }
            resource.version = 1;
            resources.insert(resource.metadata.clone(), resource.clone());
        }
        self.emit(EventType::Created, resource);
        Ok(())
    }

    async fn get(&self, metadata: &Metadata) -> Result<Resource, StoreError> {
        lock(&self.resources)
            .get(metadata)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(metadata.to_string()))
    }

    async fn list(&self, namespace: &str, kind: &str) -> Result<Vec<Resource>, StoreError> {
        let mut items: Vec<Resource> = lock(&self.resources)
            .values()
            .filter(|r| r.metadata.namespace == namespace && r.metadata.kind == kind)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.metadata.cmp(&b.metadata));
        Ok(items)
    }

    async fn update(&self, resource: Resource) -> Result<(), StoreError> {
        let spec = resource.spec;
        self.modify(&resource.metadata, move |existing| {
            existing.spec = spec;
            true
        })
    }

    async fn watch_for(
        &self,
        ctx: &CancellationToken,
        metadata: &Metadata,
        events: &[EventType],
    ) -> Result<Resource, StoreError> {
        let mut rx = self.events.subscribe();
        let wants_existing =
            events.contains(&EventType::Created) || events.contains(&EventType::Updated);

        if wants_existing && let Ok(resource) = self.get(metadata).await {
            return Ok(resource);
        }

        loop {
            let event = tokio::select! {
                _ = ctx.cancelled() => return Err(StoreError::Cancelled),
                event = rx.recv() => event,
            };

            match event {
                Ok(event)
                    if event.resource.metadata == *metadata
                        && events.contains(&event.event_type) =>
                {
                    return Ok(event.resource);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if wants_existing && let Ok(resource) = self.get(metadata).await {
                        return Ok(resource);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StoreError::Cancelled),
            }
        }
    }

    async fn add_finalizer(&self, metadata: &Metadata, finalizer: &str) -> Result<(), StoreError> {
        self.modify(metadata, |resource| {
            resource.finalizers.insert(finalizer.to_string())
        })
    }

    async fn remove_finalizer(
        &self,
        metadata: &Metadata,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.modify(metadata, |resource| resource.finalizers.remove(finalizer))
    }

    async fn destroy(&self, metadata: &Metadata) -> Result<(), StoreError> {
        let removed = {
            let mut resources = lock(&self.resources);
            match resources.get(metadata) {
                None => return Err(StoreError::NotFound(metadata.to_string())),
                Some(resource) if !resource.finalizers.is_empty() => {
                    return Err(StoreError::PendingFinalizers(metadata.to_string()));
                }
                Some(_) => resources.remove(metadata),
            }
        };
        if let Some(resource) = removed {
            self.emit(EventType::Destroyed, resource);
        }
        Ok(())
    }
}
