#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, sync::Arc};

use common::wait_until;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use nodevisor::{
    config::load_config,
    constants::EVENT_BUS_CAPACITY,
    events::{EventBus, ServiceState},
    logging::FileLoggingManager,
    runtime::{Runtime, RuntimeMode},
    service::Service,
    supervisor::Supervisor,
};

const CONFIG: &str = r#"
log_dir: logs
env_file: node.env
environment:
  NODE: ${NODE_NAME}
services:
  - id: first
    command: ["/bin/sh", "-c", "exec sleep 30"]
    restart: always
    graceful_shutdown_timeout: 1s
    health:
      command: ["/bin/true"]
      initial_delay: 10ms
      period: 50ms
  - id: second
    command: ["/bin/sh", "-c", "echo second on $NODE"]
    depends_on: [first]
    restart: never
"#;

fn write_config(dir: &Path) -> std::path::PathBuf {
    fs::write(dir.join("node.env"), "NODE_NAME=\"worker-1\"\n").unwrap();
    let path = dir.join("nodevisor.yaml");
    fs::write(&path, CONFIG).unwrap();
    path
}

#[tokio::test]
async fn configured_services_run_in_dependency_order() {
    let temp = tempdir().unwrap();
    let config = load_config(&write_config(temp.path())).unwrap();
    let log_dir = config.log_dir(RuntimeMode::User);
    assert_eq!(log_dir, temp.path().join("logs"));

    let services: Vec<Arc<dyn Service>> = config
        .services()
        .unwrap()
        .into_iter()
        .map(|service| Arc::new(service.with_wrapper(None)) as Arc<dyn Service>)
        .collect();

    let runtime = Runtime::new(config.runtime_config())
        .with_logging(Arc::new(FileLoggingManager::new(&log_dir)))
        .with_events(EventBus::new(EVENT_BUS_CAPACITY));
    let supervisor = Supervisor::new(Arc::new(runtime));
    supervisor.load_and_start(services).unwrap();

    let first = supervisor.get("first").unwrap();
    let second = supervisor.get("second").unwrap();

    wait_until("second to finish", || second.get_state() == ServiceState::Finished).await;
    assert_eq!(first.get_state(), ServiceState::Running);
    assert_eq!(first.info().health.unwrap().healthy, Some(true));

    let output = fs::read_to_string(log_dir.join("second.log")).unwrap();
    assert_eq!(output, "second on worker-1\n");

    supervisor.shutdown(&CancellationToken::new()).await.unwrap();
    assert!(first.get_state().is_down());
}

#[test]
fn duplicate_ids_are_rejected() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("nodevisor.yaml");
    fs::write(
        &path,
        r#"
services:
  - id: apid
    command: ["/apid"]
  - id: apid
    command: ["/apid", "--again"]
"#,
    )
    .unwrap();

    let err = load_config(&path).unwrap().services().unwrap_err();
    assert!(err.to_string().contains("duplicate service id"), "{err}");
}
