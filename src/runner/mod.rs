//! Runners execute one service payload: a process, an in-process task or a container.
//!
//! Every runner follows the same contract: `open` once, then any number of
//! `run`/`stop` cycles, then `close`. `stop` asks the in-flight `run` to wind down
//! and waits until it has returned, after which the runner is ready for another
//! cycle. [`restart`] builds on that to re-run a payload according to a policy.

pub mod container;
pub mod cri;
pub mod process;
pub mod restart;
pub mod task;

use std::{fmt, path::PathBuf, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{
        DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT, SYSTEM_CONTAINERD_ADDRESS, SYSTEM_CONTAINERD_NAMESPACE,
        WRAPPERD_PATH,
    },
    error::RunnerError,
    events::Recorder,
    logging::{LoggingManager, NullLoggingManager},
    sandbox::{IoPriority, SchedulingPolicy},
    util::lock,
};
use cri::{ContainerSpec, SeccompProfile};

#[async_trait]
pub trait Runner: fmt::Display + Send + Sync {
    /// Prepares resources needed by `run`.
    async fn open(&self) -> Result<(), RunnerError>;

    /// Runs the payload to completion, reporting progress through `recorder`.
    async fn run(&self, recorder: Recorder) -> Result<(), RunnerError>;

    /// Stops the current `run` and waits for it to return.
    async fn stop(&self) -> Result<(), RunnerError>;

    /// Releases what `open` acquired.
    async fn close(&self) -> Result<(), RunnerError>;
}

/// Identity and argv of the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    pub id: String,
    pub process_args: Vec<String>,
}

impl Args {
    pub fn new<S: Into<String>>(id: impl Into<String>, process_args: impl IntoIterator<Item = S>) -> Self {
        Self {
            id: id.into(),
            process_args: process_args.into_iter().map(Into::into).collect(),
        }
    }
}

/// How much of the supervisor environment a process inherits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvInheritance {
    /// Only `PATH` plus the configured variables.
    #[default]
    Clean,
    /// The full supervisor environment plus the configured variables.
    Inherit,
}

/// Stdout or stderr destination overriding the service log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Log,
    File(PathBuf),
}

/// Mutates the container spec before it is created.
pub type SpecHook = Arc<dyn Fn(&mut ContainerSpec) + Send + Sync>;

/// Replaces the default seccomp profile.
pub type SeccompHook = Arc<dyn Fn(&mut SeccompProfile) + Send + Sync>;

/// Runner configuration shared by all runner kinds.
#[derive(Clone)]
pub struct Options {
    pub logging: Arc<dyn LoggingManager>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub env_inheritance: EnvInheritance,
    pub container_runtime_address: PathBuf,
    pub namespace: String,
    pub container_image: Option<String>,
    pub graceful_shutdown_timeout: Duration,
    /// Bytes fed to stdin, then EOF.
    pub stdin: Option<Arc<[u8]>>,
    pub stdin_file: Option<PathBuf>,
    pub stdout: OutputTarget,
    pub stderr: OutputTarget,
    pub oom_score_adj: i32,
    pub cgroup_path: Option<String>,
    pub selinux_label: Option<String>,
    pub dropped_capabilities: Vec<String>,
    pub priority: Option<i32>,
    pub io_priority: Option<IoPriority>,
    pub scheduling_policy: Option<SchedulingPolicy>,
    /// File descriptor number, in the child, that becomes the controlling terminal.
    pub ctty: Option<i32>,
    pub uid: Option<u32>,
    pub memory_limit: Option<u64>,
    pub spec_hooks: Vec<SpecHook>,
    pub seccomp_override: Option<SeccompHook>,
    /// Sandbox helper to re-exec through; `None` applies the sandbox in-process.
    pub wrapper: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            logging: Arc::new(NullLoggingManager),
            env: Vec::new(),
            env_inheritance: EnvInheritance::default(),
            container_runtime_address: PathBuf::from(SYSTEM_CONTAINERD_ADDRESS),
            namespace: SYSTEM_CONTAINERD_NAMESPACE.to_string(),
            container_image: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            stdin: None,
            stdin_file: None,
            stdout: OutputTarget::Log,
            stderr: OutputTarget::Log,
            oom_score_adj: 0,
            cgroup_path: None,
            selinux_label: None,
            dropped_capabilities: Vec::new(),
            priority: None,
            io_priority: None,
            scheduling_policy: None,
            ctty: None,
            uid: None,
            memory_limit: None,
            spec_hooks: Vec::new(),
            seccomp_override: None,
            wrapper: Some(PathBuf::from(WRAPPERD_PATH)),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("env", &self.env)
            .field("env_inheritance", &self.env_inheritance)
            .field("namespace", &self.namespace)
            .field("container_image", &self.container_image)
            .field("graceful_shutdown_timeout", &self.graceful_shutdown_timeout)
            .field("cgroup_path", &self.cgroup_path)
            .field("oom_score_adj", &self.oom_score_adj)
            .field("uid", &self.uid)
            .field("wrapper", &self.wrapper)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn with_logging(mut self, logging: Arc<dyn LoggingManager>) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_env<S: Into<String>>(mut self, env: impl IntoIterator<Item = S>) -> Self {
        self.env.extend(env.into_iter().map(Into::into));
        self
    }

    pub fn with_env_inheritance(mut self, inheritance: EnvInheritance) -> Self {
        self.env_inheritance = inheritance;
        self
    }

    pub fn with_container_runtime_address(mut self, address: impl Into<PathBuf>) -> Self {
        self.container_runtime_address = address.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = Some(image.into());
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Arc<[u8]>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn with_stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = OutputTarget::File(path.into());
        self
    }

    pub fn with_stderr_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = OutputTarget::File(path.into());
        self
    }

    pub fn with_oom_score_adj(mut self, score: i32) -> Self {
        self.oom_score_adj = score;
        self
    }

    pub fn with_cgroup_path(mut self, path: impl Into<String>) -> Self {
        self.cgroup_path = Some(path.into());
        self
    }

    pub fn with_selinux_label(mut self, label: impl Into<String>) -> Self {
        self.selinux_label = Some(label.into());
        self
    }

    pub fn with_dropped_capabilities<S: Into<String>>(
        mut self,
        caps: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dropped_capabilities.extend(caps.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_io_priority(mut self, priority: IoPriority) -> Self {
        self.io_priority = Some(priority);
        self
    }

    pub fn with_scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling_policy = Some(policy);
        self
    }

    pub fn with_ctty(mut self, fd: i32) -> Self {
        self.ctty = Some(fd);
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_spec_hook(mut self, hook: SpecHook) -> Self {
        self.spec_hooks.push(hook);
        self
    }

    pub fn with_seccomp_override(mut self, hook: SeccompHook) -> Self {
        self.seccomp_override = Some(hook);
        self
    }

    pub fn with_wrapper(mut self, wrapper: Option<PathBuf>) -> Self {
        self.wrapper = wrapper;
        self
    }
}

/// Stop channel pair of one run cycle.
#[derive(Clone)]
pub(crate) struct Cycle {
    pub(crate) stop: CancellationToken,
    stopped: CancellationToken,
}

impl Cycle {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }
}

/// Marks the cycle finished when dropped, even if `run` is abandoned.
pub(crate) struct CycleGuard(CancellationToken);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Coordinates `run` and `stop` across cycles.
pub(crate) struct CycleControl {
    current: Mutex<Cycle>,
}

impl Default for CycleControl {
    fn default() -> Self {
        Self {
            current: Mutex::new(Cycle::new()),
        }
    }
}

impl CycleControl {
    /// Called at the start of `run`; the guard must live until `run` returns.
    pub(crate) fn begin(&self) -> (Cycle, CycleGuard) {
        let mut current = lock(&self.current);
        // previous run returned on its own
        if current.stopped.is_cancelled() {
            *current = Cycle::new();
        }
        let cycle = current.clone();
        drop(current);
        let guard = CycleGuard(cycle.stopped.clone());
        (cycle, guard)
    }

    /// Signals the current cycle, waits for its `run` to return, then arms a new cycle.
    pub(crate) async fn stop(&self) {
        let cycle = lock(&self.current).clone();
        cycle.stop.cancel();
        cycle.stopped.cancelled().await;

        let mut current = lock(&self.current);
        if current.stopped.is_cancelled() {
            *current = Cycle::new();
        }
    }
}
