use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::sync::broadcast;
use tracing::debug;

use super::{Args, CycleControl, EnvInheritance, Options, OutputTarget, Runner};
use crate::{
    constants::{DEFAULT_PATH, LOG_BUFFER_SIZE},
    error::RunnerError,
    events::{Recorder, ServiceState},
    logging::open_service_log,
    reaper::{self, ProcessExit},
    sandbox::SandboxPlan,
    util::lock,
};

/// How long output pumps may keep draining after the process exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type SharedLog = Arc<Mutex<Box<dyn Write + Send>>>;

/// Runs a payload as a child process.
pub struct ProcessRunner {
    debug: bool,
    args: Args,
    opts: Options,
    cycle: CycleControl,
}

impl ProcessRunner {
    pub fn new(debug: bool, args: Args, opts: Options) -> Self {
        Self {
            debug,
            args,
            opts,
            cycle: CycleControl::default(),
        }
    }

    fn sandbox_plan(&self) -> SandboxPlan {
        SandboxPlan {
            name: self.args.id.clone(),
            cgroup_path: self.opts.cgroup_path.clone(),
            dropped_capabilities: self.opts.dropped_capabilities.clone(),
            oom_score_adj: self.opts.oom_score_adj,
            uid: self.opts.uid,
            priority: self.opts.priority,
            io_priority: self.opts.io_priority,
            scheduling_policy: self.opts.scheduling_policy,
            selinux_label: self.opts.selinux_label.clone(),
        }
    }

    fn setup_err(&self) -> impl Fn(io::Error) -> RunnerError + '_ {
        move |source| RunnerError::Setup {
            id: self.args.id.clone(),
            source,
        }
    }

    /// Builds the command, routed through the sandbox helper when one is configured.
    pub fn build_command(&self) -> Result<Command, RunnerError> {
        let (program, rest) = self
            .args
            .process_args
            .split_first()
            .ok_or_else(|| RunnerError::EmptyCommand {
                id: self.args.id.clone(),
            })?;

        let plan = self.sandbox_plan();
        let mut command = match &self.opts.wrapper {
            Some(wrapper) => {
                let mut command = Command::new(wrapper);
                command.args(plan.to_args()).arg("--").arg(program).args(rest);
                command
            }
            None => {
                let mut command = Command::new(program);
                command.args(rest);
                command
            }
        };

        if self.opts.env_inheritance == EnvInheritance::Clean {
            command.env_clear().env("PATH", DEFAULT_PATH);
        }
        for pair in &self.opts.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }

        if let Some(fd) = self.opts.ctty {
            unsafe {
                command.pre_exec(move || {
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        if self.opts.wrapper.is_none() {
            unsafe {
                command.pre_exec(move || plan.apply_pre_exec());
            }
        }

        let stdin = if let Some(path) = &self.opts.stdin_file {
            Stdio::from(File::open(path).map_err(self.setup_err())?)
        } else if self.opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        command
            .stdin(stdin)
            .stdout(self.output(&self.opts.stdout)?)
            .stderr(self.output(&self.opts.stderr)?);

        Ok(command)
    }

    fn output(&self, target: &OutputTarget) -> Result<Stdio, RunnerError> {
        match target {
            OutputTarget::Log => Ok(Stdio::piped()),
            OutputTarget::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(self.setup_err())?;
                Ok(Stdio::from(file))
            }
        }
    }

    fn exit_result(&self, status: io::Result<ExitStatus>) -> Result<(), RunnerError> {
        let status = status.map_err(|source| RunnerError::Wait {
            id: self.args.id.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(RunnerError::Exit {
                id: self.args.id.clone(),
                status: status.to_string(),
            })
        }
    }

    fn signal(&self, pid: u32, sig: Signal) {
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
            debug!("failed to send {sig} to {}: {err}", self.args.id);
        }
    }
}

impl fmt::Display for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({:?})", self.args.process_args)
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn open(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn run(&self, recorder: Recorder) -> Result<(), RunnerError> {
        let (cycle, _guard) = self.cycle.begin();

        let log = open_service_log(self.opts.logging.as_ref(), &self.args.id, self.debug)
            .map_err(|source| RunnerError::Log {
                id: self.args.id.clone(),
                source,
            })?;
        let log: SharedLog = Arc::new(Mutex::new(log));

        let mut command = self.build_command()?;
        // Subscribe before spawning so the exit cannot be missed.
        let exits = reaper::notify();
        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            id: self.args.id.clone(),
            source,
        })?;
        let pid = child.id();

        let pumps: Vec<JoinHandle<()>> = [
            pump(child.stdout.take(), Arc::clone(&log)),
            pump(child.stderr.take(), Arc::clone(&log)),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let Some(mut stdin) = child.stdin.take()
            && let Some(bytes) = self.opts.stdin.clone()
        {
            // Dropping the pipe after the write delivers EOF.
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
        }

        recorder(
            ServiceState::Running,
            format!("Process {self} started with PID {pid}"),
        );

        let wait = wait_exit(child, exits);
        tokio::pin!(wait);

        let exited = tokio::select! {
            status = &mut wait => Some(status),
            _ = cycle.stop.cancelled() => None,
        };
        if let Some(status) = exited {
            drain(pumps).await;
            return self.exit_result(status);
        }

        recorder(ServiceState::Stopping, format!("Sending SIGTERM to {self}"));
        self.signal(pid, Signal::SIGTERM);

        tokio::select! {
            _ = &mut wait => {}
            _ = tokio::time::sleep(self.opts.graceful_shutdown_timeout) => {
                recorder(ServiceState::Stopping, format!("Sending SIGKILL to {self}"));
                self.signal(pid, Signal::SIGKILL);
                let _ = (&mut wait).await;
            }
        }

        drain(pumps).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        self.cycle.stop().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RunnerError> {
        Ok(())
    }
}

fn pump<R: Read + Send + 'static>(reader: Option<R>, log: SharedLog) -> Option<JoinHandle<()>> {
    let mut reader = reader?;
    Some(thread::spawn(move || {
        let mut buf = [0u8; LOG_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut writer = lock(&log);
                    if writer.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }
        }
    }))
}

/// Waits for output pumps, giving up if a grandchild keeps the pipes open.
async fn drain(pumps: Vec<JoinHandle<()>>) {
    if pumps.is_empty() {
        return;
    }
    let join = tokio::task::spawn_blocking(move || {
        for pump in pumps {
            let _ = pump.join();
        }
    });
    let _ = tokio::time::timeout(LOG_DRAIN_TIMEOUT, join).await;
}

async fn wait_exit(
    mut child: Child,
    exits: Option<broadcast::Receiver<ProcessExit>>,
) -> io::Result<ExitStatus> {
    match exits {
        Some(rx) => reaper::wait_for(rx, child.id()).await,
        None => tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(io::Error::other)?,
    }
}
