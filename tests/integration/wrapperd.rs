use std::{fs, path::PathBuf, sync::Arc};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

use nodevisor::{
    events::null_recorder,
    logging::FileLoggingManager,
    runner::{Args, Options, Runner, process::ProcessRunner},
};

fn wrapperd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("wrapperd"))
}

#[test]
fn execs_the_payload() {
    wrapperd()
        .args(["--name", "echo", "--", "/bin/echo", "hi"])
        .assert()
        .success()
        .stdout("hi\n");
}

#[test]
fn payload_flags_are_not_parsed() {
    wrapperd()
        .args(["--name", "sh", "--", "/bin/sh", "-c", "echo $0", "--name"])
        .assert()
        .success()
        .stdout("--name\n");
}

#[test]
fn command_is_required() {
    wrapperd()
        .args(["--name", "empty"])
        .assert()
        .failure();
}

#[test]
fn missing_program_exits_127() {
    wrapperd()
        .args(["--name", "ghost", "--", "/nonexistent/ghost"])
        .assert()
        .code(127)
        .stderr(predicate::str::contains("failed to exec /nonexistent/ghost"));
}

#[cfg(target_os = "linux")]
#[test]
fn oom_score_is_applied_before_exec() {
    wrapperd()
        .args(["--name", "oom", "--oom-score=1000", "--", "/bin/cat", "/proc/self/oom_score_adj"])
        .assert()
        .success()
        .stdout("1000\n");
}

#[tokio::test]
async fn process_runner_goes_through_wrapper() {
    let temp = tempdir().unwrap();
    let runner = ProcessRunner::new(
        false,
        Args::new("wrapped", ["/bin/sh", "-c", "echo wrapped $GREETING"]),
        Options::default()
            .with_wrapper(Some(PathBuf::from(assert_cmd::cargo::cargo_bin!("wrapperd"))))
            .with_env(["GREETING=hello"])
            .with_logging(Arc::new(FileLoggingManager::new(temp.path()))),
    );

    runner.run(null_recorder()).await.unwrap();

    let log = fs::read_to_string(temp.path().join("wrapped.log")).unwrap();
    assert_eq!(log, "wrapped hello\n");
}
