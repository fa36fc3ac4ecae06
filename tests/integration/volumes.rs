#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, time::Duration};

use common::{TestService, history, wait_until};
use tokio_util::sync::CancellationToken;

use nodevisor::{
    constants::{VOLUME_FINALIZER, VOLUME_MOUNT_REQUEST_TYPE, VOLUME_NAMESPACE},
    events::ServiceState,
    resources::{
        Resource,
        volume::{VolumeMountStatusSpec, request_metadata, status_metadata},
    },
    runtime::{Runtime, RuntimeConfig},
    supervisor::Supervisor,
};

fn supervisor(config: RuntimeConfig) -> Supervisor {
    Supervisor::with_wait_interval(
        Arc::new(Runtime::new(config)),
        Duration::from_millis(20),
    )
}

#[tokio::test]
async fn service_waits_for_volume_status() {
    let supervisor = supervisor(RuntimeConfig::default());
    supervisor
        .load_and_start([TestService::new("etcd").volumes(&["EPHEMERAL"]).build()])
        .unwrap();
    let runner = supervisor.get("etcd").unwrap();
    let store = Arc::clone(supervisor.runtime().state());

    wait_until("volume wait", || runner.get_state() == ServiceState::Waiting).await;
    assert_eq!(
        history(&runner)[0].message,
        "Waiting for volume \"EPHEMERAL\" to be mounted"
    );

    let requests = store
        .list(VOLUME_NAMESPACE, VOLUME_MOUNT_REQUEST_TYPE)
        .await
        .unwrap();
    assert_eq!(requests.len(), 1);
    let request_id = requests[0].metadata.id.clone();
    assert_eq!(request_id, "service/etcd-EPHEMERAL");

    // still waiting without a status
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.get_state(), ServiceState::Waiting);

    let status = VolumeMountStatusSpec {
        requester: "service/etcd".into(),
        volume_id: "EPHEMERAL".into(),
        target: "/var".into(),
    };
    store
        .create(Resource::new(status_metadata(&request_id), &status).unwrap())
        .await
        .unwrap();

    wait_until("etcd to run", || runner.get_state() == ServiceState::Running).await;
    let pinned = store.get(&status_metadata(&request_id)).await.unwrap();
    assert!(pinned.finalizers.contains(VOLUME_FINALIZER));

    supervisor
        .unload(&CancellationToken::new(), &["etcd"])
        .await
        .unwrap();
    assert!(supervisor.get("etcd").is_none());
    assert!(
        store
            .get(&request_metadata(&request_id))
            .await
            .unwrap_err()
            .is_not_found()
    );
    let released = store.get(&status_metadata(&request_id)).await.unwrap();
    assert!(released.finalizers.is_empty());
}

#[tokio::test]
async fn containers_skip_volume_requests() {
    let supervisor = supervisor(RuntimeConfig {
        in_container: true,
        ..RuntimeConfig::default()
    });
    supervisor
        .load_and_start([TestService::new("apid").volumes(&["STATE"]).build()])
        .unwrap();
    let runner = supervisor.get("apid").unwrap();

    wait_until("apid to run", || runner.get_state() == ServiceState::Running).await;
    assert!(
        supervisor
            .runtime()
            .state()
            .list(VOLUME_NAMESPACE, VOLUME_MOUNT_REQUEST_TYPE)
            .await
            .unwrap()
            .is_empty()
    );

    supervisor.shutdown(&CancellationToken::new()).await.unwrap();
}
