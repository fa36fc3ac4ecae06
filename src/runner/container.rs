use std::{
    fmt, io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::oneshot,
};
use tracing::{debug, warn};

use super::{
    Args, CycleControl, Options, Runner,
    cri::{ContainerClient, ContainerConnector, ContainerSpec, Mount, SeccompProfile, TaskExit, TaskIo},
};
use crate::{
    constants::CONTAINER_CLOSE_TIMEOUT,
    error::{ContainerError, RunnerError},
    events::{Recorder, ServiceState},
    logging::open_service_log,
    util::lock,
};

/// Runs a payload as a container task through the container runtime.
pub struct ContainerRunner {
    debug: bool,
    args: Args,
    opts: Options,
    connector: Arc<dyn ContainerConnector>,
    client: Mutex<Option<Arc<dyn ContainerClient>>>,
    cycle: CycleControl,
}

impl ContainerRunner {
    pub fn new(debug: bool, args: Args, opts: Options, connector: Arc<dyn ContainerConnector>) -> Self {
        Self {
            debug,
            args,
            opts,
            connector,
            client: Mutex::new(None),
            cycle: CycleControl::default(),
        }
    }

    fn id(&self) -> &str {
        &self.args.id
    }

    fn namespace(&self) -> &str {
        &self.opts.namespace
    }

    fn client(&self) -> Result<Arc<dyn ContainerClient>, ContainerError> {
        lock(&self.client)
            .clone()
            .ok_or_else(|| ContainerError::NotOpen(self.args.id.clone()))
    }

    /// Container spec with defaults applied, then the seccomp override, then the spec hooks.
    pub fn container_spec(&self, image: Option<String>) -> ContainerSpec {
        let mut seccomp = SeccompProfile::default();
        if let Some(hook) = &self.opts.seccomp_override {
            hook(&mut seccomp);
        }

        let mut spec = ContainerSpec {
            id: self.args.id.clone(),
            image,
            args: self.args.process_args.clone(),
            env: self.opts.env.clone(),
            host_network: true,
            mounts: vec![
                Mount::read_only_bind("/etc/resolv.conf"),
                Mount::read_only_bind("/etc/hosts"),
            ],
            no_new_privileges: true,
            seccomp: Some(seccomp),
            cgroup_path: self.opts.cgroup_path.clone(),
            oom_score_adj: self.opts.oom_score_adj,
            memory_limit: self.opts.memory_limit,
            selinux_label: self.opts.selinux_label.clone(),
            dropped_capabilities: self.opts.dropped_capabilities.clone(),
        };
        for hook in &self.opts.spec_hooks {
            hook(&mut spec);
        }
        spec
    }

    fn stdin(&self) -> Result<(Option<Box<dyn AsyncRead + Send + Unpin>>, Option<oneshot::Receiver<()>>), RunnerError> {
        let reader: Box<dyn AsyncRead + Send + Unpin> = if let Some(bytes) = &self.opts.stdin {
            Box::new(io::Cursor::new(Arc::clone(bytes)))
        } else if let Some(path) = &self.opts.stdin_file {
            let file = std::fs::File::open(path).map_err(|source| RunnerError::Setup {
                id: self.args.id.clone(),
                source,
            })?;
            Box::new(tokio::fs::File::from_std(file))
        } else {
            return Ok((None, None));
        };

        let (tx, rx) = oneshot::channel();
        Ok((Some(Box::new(NotifyOnEof::new(reader, tx))), Some(rx)))
    }

    async fn kill(&self, client: &Arc<dyn ContainerClient>, signal: Signal) {
        if let Err(err) = client
            .kill_task(self.namespace(), self.id(), signal, true)
            .await
        {
            debug!("failed to send {signal} to {}: {err}", self.id());
        }
    }
}

impl fmt::Display for ContainerRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Containerd({:?})", self.args.id)
    }
}

fn ignore_not_found(result: Result<(), ContainerError>) -> Result<(), ContainerError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn open(&self) -> Result<(), RunnerError> {
        let client = self
            .connector
            .connect(&self.opts.container_runtime_address)
            .await?;

        let image = match &self.opts.container_image {
            Some(reference) => Some(client.image_status(self.namespace(), reference).await?),
            None => None,
        };

        // Leftovers of a previous supervisor instance.
        ignore_not_found(client.delete_container(self.namespace(), self.id(), true).await)?;
        ignore_not_found(client.delete_snapshot(self.namespace(), self.id()).await)?;

        let spec = self.container_spec(image);
        client.create_container(self.namespace(), &spec).await?;

        *lock(&self.client) = Some(client);
        Ok(())
    }

    async fn run(&self, recorder: Recorder) -> Result<(), RunnerError> {
        let client = self.client()?;
        let (cycle, _guard) = self.cycle.begin();

        ignore_not_found(client.delete_task(self.namespace(), self.id()).await)?;

        let log = open_service_log(self.opts.logging.as_ref(), self.id(), self.debug).map_err(
            |source| RunnerError::Log {
                id: self.args.id.clone(),
                source,
            },
        )?;
        let (stdin, eof) = self.stdin()?;

        let pid = client
            .create_task(self.namespace(), self.id(), TaskIo { stdin, stdout: log })
            .await?;
        let mut exit = client.wait_task(self.namespace(), self.id()).await?;
        client.start_task(self.namespace(), self.id()).await?;

        if let Some(eof) = eof {
            let client = Arc::clone(&client);
            let namespace = self.opts.namespace.clone();
            let id = self.args.id.clone();
            tokio::spawn(async move {
                if eof.await.is_ok()
                    && let Err(err) = client.close_io(&namespace, &id).await
                {
                    debug!("failed to close stdin of {id}: {err}");
                }
            });
        }

        let task = format!("task {} (PID {pid}) for container {}", self.id(), self.id());
        recorder(ServiceState::Running, format!("Started {task}"));

        let exited = tokio::select! {
            status = &mut exit => Some(status),
            _ = cycle.stop.cancelled() => None,
        };

        let status: Option<TaskExit> = match exited {
            Some(status) => Some(status.map_err(|_| {
                RunnerError::other(format!("lost exit status of container {}", self.id()))
            })?),
            None => {
                recorder(ServiceState::Stopping, format!("Sending SIGTERM to {task}"));
                self.kill(&client, Signal::SIGTERM).await;

                tokio::select! {
                    _ = &mut exit => {}
                    _ = tokio::time::sleep(self.opts.graceful_shutdown_timeout) => {
                        recorder(ServiceState::Stopping, format!("Sending SIGKILL to {task}"));
                        self.kill(&client, Signal::SIGKILL).await;
                        let _ = (&mut exit).await;
                    }
                }
                None
            }
        };

        ignore_not_found(client.delete_task(self.namespace(), self.id()).await)?;

        match status {
            Some(TaskExit { code, .. }) if code != 0 => Err(ContainerError::ExitCode {
                id: self.args.id.clone(),
                code,
            }
            .into()),
            _ => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), RunnerError> {
        self.cycle.stop().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), RunnerError> {
        let Some(client) = lock(&self.client).take() else {
            return Ok(());
        };

        let deleted = tokio::time::timeout(
            CONTAINER_CLOSE_TIMEOUT,
            client.delete_container(self.namespace(), self.id(), true),
        )
        .await
        .map_err(|_| ContainerError::Timeout(format!("deleting container {}", self.id())))?;
        ignore_not_found(deleted)?;

        if let Err(err) = client.close().await {
            warn!("failed to close container client for {}: {err}", self.id());
        }
        Ok(())
    }
}

/// Fires once when the wrapped reader reaches EOF.
struct NotifyOnEof<R> {
    inner: R,
    eof: Option<oneshot::Sender<()>>,
}

impl<R> NotifyOnEof<R> {
    fn new(inner: R, eof: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            eof: Some(eof),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for NotifyOnEof<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(())))
            && buf.filled().len() == before
            && buf.remaining() > 0
            && let Some(eof) = this.eof.take()
        {
            let _ = eof.send(());
        }
        poll
    }
}
