#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, sync::Arc, time::Duration};

use common::{recording, wait_until};
use tempfile::tempdir;

use nodevisor::{
    events::{ServiceState, null_recorder},
    logging::FileLoggingManager,
    runner::{Args, Options, Runner, process::ProcessRunner},
};

fn shell(id: &str, script: &str, logs: &Path, opts: Options) -> Arc<ProcessRunner> {
    Arc::new(ProcessRunner::new(
        false,
        Args::new(id, ["/bin/sh", "-c", script]),
        opts.with_wrapper(None)
            .with_logging(Arc::new(FileLoggingManager::new(logs))),
    ))
}

fn log(logs: &Path, id: &str) -> String {
    fs::read_to_string(logs.join(format!("{id}.log"))).unwrap_or_default()
}

#[tokio::test]
async fn output_goes_to_service_log() {
    let temp = tempdir().unwrap();
    let runner = shell(
        "greeter",
        "echo hello; echo oops >&2",
        temp.path(),
        Options::default(),
    );

    runner.run(null_recorder()).await.unwrap();

    let output = log(temp.path(), "greeter");
    assert!(output.contains("hello"));
    assert!(output.contains("oops"));
}

#[tokio::test]
async fn failing_exit_is_reported() {
    let temp = tempdir().unwrap();
    let runner = shell("failing", "exit 3", temp.path(), Options::default());

    let err = runner.run(null_recorder()).await.unwrap_err();
    assert!(err.to_string().contains("exit status: 3"), "{err}");
}

#[tokio::test]
async fn environment_is_clean_plus_configured() {
    let temp = tempdir().unwrap();
    let runner = shell(
        "env",
        "echo \"greeting=$GREETING home=${HOME:-unset}\"",
        temp.path(),
        Options::default().with_env(["GREETING=hi"]),
    );

    runner.run(null_recorder()).await.unwrap();
    assert!(log(temp.path(), "env").contains("greeting=hi home=unset"));
}

#[tokio::test]
async fn stdin_is_delivered() {
    let temp = tempdir().unwrap();
    let runner = shell(
        "reader",
        "cat",
        temp.path(),
        Options::default().with_stdin(b"from stdin\n".to_vec()),
    );

    runner.run(null_recorder()).await.unwrap();
    assert_eq!(log(temp.path(), "reader"), "from stdin\n");
}

#[tokio::test]
async fn stop_sends_sigterm() {
    let temp = tempdir().unwrap();
    let runner = shell("sleeper", "exec sleep 30", temp.path(), Options::default());

    let (recorder, events) = recording();
    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(recorder).await })
    };
    wait_until("process to start", || !events.lock().unwrap().is_empty()).await;

    runner.stop().await.unwrap();
    handle.await.unwrap().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, ServiceState::Running);
    assert!(events[0].1.contains("started with PID"));
    assert_eq!(
        events[1],
        (
            ServiceState::Stopping,
            format!("Sending SIGTERM to {runner}")
        )
    );
}

#[tokio::test]
async fn stop_escalates_when_sigterm_is_ignored() {
    let temp = tempdir().unwrap();
    let runner = shell(
        "stubborn",
        "trap '' TERM; echo ready; while :; do sleep 0.05; done",
        temp.path(),
        Options::default().with_graceful_shutdown_timeout(Duration::from_millis(100)),
    );

    let (recorder, events) = recording();
    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(recorder).await })
    };
    let logs = temp.path().to_path_buf();
    wait_until("trap to be installed", || log(&logs, "stubborn").contains("ready")).await;

    tokio::time::timeout(Duration::from_secs(5), runner.stop())
        .await
        .expect("stop returns")
        .unwrap();
    handle.await.unwrap().unwrap();

    let states: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .map(|(_, message)| message.clone())
        .collect();
    assert_eq!(
        states[1..],
        [
            format!("Sending SIGTERM to {runner}"),
            format!("Sending SIGKILL to {runner}"),
        ]
    );
}

#[tokio::test]
async fn runner_can_be_reused() {
    let temp = tempdir().unwrap();
    let runner = shell("again", "echo run", temp.path(), Options::default());

    runner.run(null_recorder()).await.unwrap();
    runner.run(null_recorder()).await.unwrap();
    assert_eq!(log(temp.path(), "again"), "run\nrun\n");
}

#[test]
fn wrapper_receives_sandbox_flags() {
    let runner = ProcessRunner::new(
        false,
        Args::new("apid", ["/apid", "--debug"]),
        Options::default()
            .with_cgroup_path("/system/apid")
            .with_oom_score_adj(-998),
    );

    let command = runner.build_command().unwrap();
    assert_eq!(command.get_program(), "/sbin/wrapperd");
    let args: Vec<_> = command
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        args,
        vec![
            "--name",
            "apid",
            "--cgroup-path",
            "/system/apid",
            "--oom-score=-998",
            "--",
            "/apid",
            "--debug",
        ]
    );
}
