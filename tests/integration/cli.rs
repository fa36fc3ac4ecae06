use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn nodevisor() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("nodevisor"))
}

#[test]
fn validate_lists_services() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("nodevisor.yaml");
    fs::write(
        &config,
        r#"
services:
  - id: containerd
    command: ["/bin/containerd"]
  - id: kubelet
    command: ["/bin/kubelet"]
    depends_on: [containerd]
"#,
    )
    .unwrap();

    nodevisor()
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("containerd\n"))
        .stdout(predicate::str::contains("kubelet (after containerd)"));
}

#[test]
fn validate_rejects_bad_configs() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("nodevisor.yaml");
    fs::write(
        &config,
        r#"
services:
  - id: apid
    command: ["/apid"]
    restart: sometimes
"#,
    )
    .unwrap();

    nodevisor()
        .args(["validate", "-c"])
        .arg(&config)
        .assert()
        .failure();

    nodevisor()
        .args(["validate", "-c"])
        .arg(temp.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.yaml"));
}

#[test]
fn logs_tails_service_output() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("nodevisor.yaml");
    fs::write(
        &config,
        r#"
log_dir: logs
services:
  - id: etcd
    command: ["/bin/etcd"]
"#,
    )
    .unwrap();
    fs::create_dir_all(temp.path().join("logs")).unwrap();
    fs::write(temp.path().join("logs/etcd.log"), "one\ntwo\nthree\n").unwrap();

    nodevisor()
        .args(["--log-level", "error", "logs", "-s", "etcd", "-l", "2", "-c"])
        .arg(&config)
        .assert()
        .success()
        .stdout("two\nthree\n");
}

#[test]
fn logs_requires_a_service() {
    nodevisor().arg("logs").assert().failure();
}
