#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, time::Duration};

use common::{FAKE_PID, FakeConnector, FakeContainerd, recording, wait_until};
use nix::sys::signal::Signal;

use nodevisor::{
    error::{ContainerError, RunnerError},
    events::{ServiceState, null_recorder},
    runner::{
        Args, Options, Runner,
        container::ContainerRunner,
        cri::{RuntimeHealth, ServingStatus},
    },
};

fn runner(connector: &Arc<FakeConnector>, opts: Options) -> Arc<ContainerRunner> {
    Arc::new(ContainerRunner::new(
        false,
        Args::new("trapper", ["/bin/sh", "-c", "trap '' TERM; while :; do sleep 1; done"]),
        opts,
        Arc::clone(connector) as _,
    ))
}

#[tokio::test]
async fn stop_escalates_to_sigkill_after_grace_period() {
    let connector = FakeConnector::new(FakeContainerd {
        trap_sigterm: true,
        ..FakeContainerd::default()
    });
    let runner = runner(
        &connector,
        Options::default().with_graceful_shutdown_timeout(Duration::from_millis(10)),
    );
    runner.open().await.unwrap();

    let (recorder, events) = recording();
    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(recorder).await })
    };
    wait_until("task to start", || !events.lock().unwrap().is_empty()).await;

    tokio::time::timeout(Duration::from_secs(2), runner.stop())
        .await
        .expect("stop returns promptly")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run returns promptly")
        .unwrap()
        .expect("stopped run is not an error");

    let task = format!("task trapper (PID {FAKE_PID}) for container trapper");
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            (ServiceState::Running, format!("Started {task}")),
            (ServiceState::Stopping, format!("Sending SIGTERM to {task}")),
            (ServiceState::Stopping, format!("Sending SIGKILL to {task}")),
        ]
    );
    assert_eq!(
        connector.client.signals(),
        vec![Signal::SIGTERM, Signal::SIGKILL]
    );
    assert!(!connector.client.has_task("trapper"));

    runner.close().await.unwrap();
    assert!(connector.client.container("trapper").is_none());
    assert!(connector.client.is_closed());
}

#[tokio::test]
async fn cooperative_task_stops_on_sigterm() {
    let connector = FakeConnector::new(FakeContainerd::default());
    let runner = runner(&connector, Options::default());
    runner.open().await.unwrap();

    let (recorder, events) = recording();
    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(recorder).await })
    };
    wait_until("task to start", || !events.lock().unwrap().is_empty()).await;

    runner.stop().await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(connector.client.signals(), vec![Signal::SIGTERM]);
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn open_replaces_leftovers_and_resolves_image() {
    let client = FakeContainerd::default();
    client.seed_leftover("trapper");
    let connector = FakeConnector::new(client);
    let runner = runner(&connector, Options::default().with_container_image("pause:3.9"));

    runner.open().await.unwrap();

    let spec = connector.client.container("trapper").unwrap();
    assert_eq!(spec.image.as_deref(), Some("docker.io/library/pause:3.9"));
    assert_eq!(spec.args[0], "/bin/sh");
    assert!(spec.host_network);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn nonzero_exit_is_an_error() {
    let connector = FakeConnector::new(FakeContainerd {
        exit_immediately: Some(3),
        ..FakeContainerd::default()
    });
    let runner = runner(&connector, Options::default());
    runner.open().await.unwrap();

    let err = runner.run(null_recorder()).await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Container(ContainerError::ExitCode { code: 3, .. })
    ));
    assert_eq!(err.to_string(), "task \"trapper\" exited with code 3");

    // the runner can go again after a failed cycle
    let err = runner.run(null_recorder()).await.unwrap_err();
    assert!(err.to_string().ends_with("code 3"));
}

#[tokio::test]
async fn stdin_is_streamed_and_closed() {
    let connector = FakeConnector::new(FakeContainerd {
        exit_immediately: Some(0),
        ..FakeContainerd::default()
    });
    let runner = runner(
        &connector,
        Options::default().with_stdin(b"machine config".to_vec()),
    );
    runner.open().await.unwrap();
    runner.run(null_recorder()).await.unwrap();

    let client = Arc::clone(&connector.client);
    wait_until("stdin to drain", || {
        client.stdin.lock().unwrap().as_slice() == b"machine config"
            && client.closed_io() == vec!["trapper".to_string()]
    })
    .await;
}

#[tokio::test]
async fn runtime_health_connects_once() {
    let connector = FakeConnector::new(FakeContainerd::default());
    let unused = RuntimeHealth::new(Arc::clone(&connector) as _, "/run/containerd.sock");
    unused.close().await.unwrap();
    assert_eq!(connector.connects(), 0);

    let health = Arc::new(RuntimeHealth::new(
        Arc::clone(&connector) as _,
        "/run/containerd.sock",
    ));
    let check = health.health_check();
    check(Default::default()).await.unwrap();
    check(Default::default()).await.unwrap();
    assert_eq!(connector.connects(), 1);

    *connector.client.serving.lock().unwrap() = ServingStatus::NotServing;
    let err = check(Default::default()).await.unwrap_err();
    assert!(err.to_string().contains("NotServing"));

    health.close().await.unwrap();
    assert!(connector.client.is_closed());
}
