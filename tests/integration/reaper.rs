use std::{fs, sync::Arc, time::Duration};

use tempfile::tempdir;

use nodevisor::{
    events::null_recorder,
    logging::FileLoggingManager,
    reaper,
    runner::{Args, Options, Runner, process::ProcessRunner},
};

fn shell(id: &str, script: &str, logs: &FileLoggingManager) -> ProcessRunner {
    ProcessRunner::new(
        false,
        Args::new(id, ["/bin/sh", "-c", script]),
        Options::default()
            .with_wrapper(None)
            .with_logging(Arc::new(logs.clone())),
    )
}

// The reaper lives on the runtime that started it, so every check shares one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaper_owns_child_exits() {
    reaper::start().unwrap();
    assert!(reaper::is_running());
    // second start is a no-op
    reaper::start().unwrap();

    let temp = tempdir().unwrap();
    let logs = FileLoggingManager::new(temp.path());

    shell("ok", "exit 0", &logs)
        .run(null_recorder())
        .await
        .unwrap();

    let err = shell("failing", "exit 7", &logs)
        .run(null_recorder())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exit status: 7"), "{err}");

    // the shell exits first and leaves `sleep` to the subreaper
    let exits = reaper::notify().unwrap();
    shell("orphaner", "sleep 0.2 & echo $!", &logs)
        .run(null_recorder())
        .await
        .unwrap();
    let pid: u32 = fs::read_to_string(logs.log_path("orphaner"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), reaper::wait_for(exits, pid))
        .await
        .expect("orphan reaped")
        .unwrap();
    assert!(status.success());
}
