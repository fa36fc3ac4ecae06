//! Volume mount requests published by services and the statuses answering them.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{EventType, Metadata, Resource, ResourceStore};
use crate::{
    conditions::Condition,
    constants::{
        VOLUME_FINALIZER, VOLUME_MOUNT_REQUEST_TYPE, VOLUME_MOUNT_STATUS_TYPE, VOLUME_NAMESPACE,
    },
    error::{ConditionError, StoreError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountRequestSpec {
    pub requester: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountStatusSpec {
    pub requester: String,
    pub volume_id: String,
    pub target: String,
}

/// Requester tag used for a service.
pub fn requester(service_id: &str) -> String {
    format!("service/{service_id}")
}

pub fn request_id(requester: &str, volume_id: &str) -> String {
    format!("{requester}-{volume_id}")
}

pub fn request_metadata(request_id: &str) -> Metadata {
    Metadata::new(VOLUME_NAMESPACE, VOLUME_MOUNT_REQUEST_TYPE, request_id)
}

pub fn status_metadata(request_id: &str) -> Metadata {
    Metadata::new(VOLUME_NAMESPACE, VOLUME_MOUNT_STATUS_TYPE, request_id)
}

/// Publishes a mount request for `volume_id`; an existing request is reused.
pub async fn create_volume_mount_request(
    store: &dyn ResourceStore,
    requester: &str,
    volume_id: &str,
) -> Result<String, StoreError> {
    let id = request_id(requester, volume_id);
    let spec = VolumeMountRequestSpec {
        requester: requester.to_string(),
        volume_id: volume_id.to_string(),
    };

    match store.create(Resource::new(request_metadata(&id), &spec)?).await {
        Ok(()) | Err(StoreError::AlreadyExists(_)) => Ok(id),
        Err(err) => Err(err),
    }
}

/// Releases the service finalizer on each status and withdraws the requests.
pub async fn delete_volume_mount_requests(
    store: &dyn ResourceStore,
    request_ids: &[String],
) -> Result<(), StoreError> {
    for id in request_ids {
        match store
            .remove_finalizer(&status_metadata(id), VOLUME_FINALIZER)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        match store.destroy(&request_metadata(id)).await {
            Ok(()) => debug!("withdrew volume mount request {id}"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Satisfied once the status for a mount request appears; the status is then
/// pinned with the service finalizer.
pub struct VolumeMounted {
    store: Arc<dyn ResourceStore>,
    request_id: String,
    volume_id: String,
}

impl VolumeMounted {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        request_id: impl Into<String>,
        volume_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            request_id: request_id.into(),
            volume_id: volume_id.into(),
        }
    }
}

pub fn wait_for_volume_to_be_mounted(
    store: Arc<dyn ResourceStore>,
    request_id: impl Into<String>,
    volume_id: impl Into<String>,
) -> Arc<dyn Condition> {
    Arc::new(VolumeMounted::new(store, request_id, volume_id))
}

impl fmt::Display for VolumeMounted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume {:?} to be mounted", self.volume_id)
    }
}

#[async_trait]
impl Condition for VolumeMounted {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        let metadata = status_metadata(&self.request_id);
        match self
            .store
            .watch_for(ctx, &metadata, &[EventType::Created, EventType::Updated])
            .await
        {
            Ok(_) => {}
            Err(StoreError::Cancelled) => return Err(ConditionError::Cancelled),
            Err(err) => return Err(err.into()),
        }

        self.store
            .add_finalizer(&metadata, VOLUME_FINALIZER)
            .await
            .map_err(ConditionError::from)
    }
}
