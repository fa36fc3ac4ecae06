//! Zombie reaping for when the supervisor runs as PID 1 or a child subreaper.
//!
//! Once [`start`]ed, the reaper owns `waitpid(-1)`: every exit is broadcast and
//! runners spawned afterwards learn their child's status from [`notify`] instead
//! of waiting on it themselves.
use std::{
    io,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    sync::OnceLock,
};

use nix::{
    errno::Errno,
    sys::{
        signal,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tokio::{
    signal::unix::{SignalKind, signal as unix_signal},
    sync::broadcast,
};
use tracing::{debug, info};

const EXIT_CAPACITY: usize = 512;

static REAPER: OnceLock<broadcast::Sender<ProcessExit>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub status: ExitStatus,
}

/// Starts reaping on the current tokio runtime. Later calls are no-ops.
pub fn start() -> io::Result<()> {
    if REAPER.get().is_some() {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    if std::process::id() != 1
        && unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0
    {
        return Err(io::Error::last_os_error());
    }

    let mut sigchld = unix_signal(SignalKind::child())?;
    let (tx, _) = broadcast::channel(EXIT_CAPACITY);
    if REAPER.set(tx.clone()).is_err() {
        return Ok(());
    }

    tokio::spawn(async move {
        loop {
            reap(&tx);
            if sigchld.recv().await.is_none() {
                break;
            }
        }
    });

    info!("process reaper started");
    Ok(())
}

pub fn is_running() -> bool {
    REAPER.get().is_some()
}

/// Subscribes to exit notifications, if the reaper is running.
pub fn notify() -> Option<broadcast::Receiver<ProcessExit>> {
    REAPER.get().map(broadcast::Sender::subscribe)
}

/// Waits for `pid` to be reaped.
pub async fn wait_for(
    mut exits: broadcast::Receiver<ProcessExit>,
    pid: u32,
) -> io::Result<ExitStatus> {
    loop {
        match exits.recv().await {
            Ok(exit) if exit.pid == pid => return Ok(exit.status),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("reaper subscriber lagged by {missed} exits");
                if !alive(pid) {
                    return Err(io::Error::other(format!(
                        "exit status of process {pid} was lost"
                    )));
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(io::Error::other("process reaper stopped"));
            }
        }
    }
}

fn alive(pid: u32) -> bool {
    !matches!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Err(Errno::ESRCH)
    )
}

fn reap(tx: &broadcast::Sender<ProcessExit>) {
    loop {
        let (pid, status) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => (pid, ExitStatus::from_raw(code << 8)),
            Ok(WaitStatus::Signaled(pid, sig, _)) => (pid, ExitStatus::from_raw(sig as i32)),
            Ok(WaitStatus::StillAlive) | Err(_) => return,
            Ok(_) => continue,
        };

        debug!("reaped process {pid}: {status}");
        let _ = tx.send(ProcessExit {
            pid: pid.as_raw() as u32,
            status,
        });
    }
}
