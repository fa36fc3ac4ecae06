//! Container runtime client contract.
//!
//! The container runner and the runtime health helper only talk to the runtime
//! through [`ContainerClient`]; a [`ContainerConnector`] produces clients for a
//! socket address. The crate ships no connector of its own: embedders supply one
//! for their runtime (containerd over its gRPC socket, for instance).
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncRead,
    sync::{Mutex, oneshot},
};

use crate::{
    error::{BoxError, ContainerError},
    health::{HealthCheck, health_check},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub options: Vec<String>,
}

impl Mount {
    pub fn read_only_bind(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            destination: path,
            options: vec!["bind".into(), "ro".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompRule {
    pub names: Vec<String>,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompProfile {
    pub default_action: String,
    pub syscalls: Vec<SeccompRule>,
}

impl Default for SeccompProfile {
    /// Allows everything except syscalls that can alter the host kernel.
    fn default() -> Self {
        Self {
            default_action: "SCMP_ACT_ALLOW".into(),
            syscalls: vec![SeccompRule {
                names: [
                    "kexec_load",
                    "kexec_file_load",
                    "init_module",
                    "finit_module",
                    "delete_module",
                    "reboot",
                    "swapon",
                    "swapoff",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                action: "SCMP_ACT_ERRNO".into(),
            }],
        }
    }
}

/// Runtime spec of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub image: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub host_network: bool,
    pub mounts: Vec<Mount>,
    pub no_new_privileges: bool,
    pub seccomp: Option<SeccompProfile>,
    pub cgroup_path: Option<String>,
    pub oom_score_adj: i32,
    pub memory_limit: Option<u64>,
    pub selinux_label: Option<String>,
    pub dropped_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExit {
    pub pid: u32,
    pub code: u32,
}

/// Streams attached to a new task.
pub struct TaskIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn std::io::Write + Send>,
}

impl fmt::Debug for TaskIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskIo")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Resolves an image reference to the stored image name.
    async fn image_status(&self, namespace: &str, reference: &str)
    -> Result<String, ContainerError>;

    async fn pull_image(&self, namespace: &str, reference: &str) -> Result<String, ContainerError>;

    async fn list_images(&self, namespace: &str) -> Result<Vec<String>, ContainerError>;

    async fn create_container(
        &self,
        namespace: &str,
        spec: &ContainerSpec,
    ) -> Result<(), ContainerError>;

    /// Deletes the container, optionally with its snapshot.
    async fn delete_container(
        &self,
        namespace: &str,
        id: &str,
        with_snapshot: bool,
    ) -> Result<(), ContainerError>;

    async fn delete_snapshot(&self, namespace: &str, id: &str) -> Result<(), ContainerError>;

    /// Creates the container task and returns its pid.
    async fn create_task(
        &self,
        namespace: &str,
        id: &str,
        io: TaskIo,
    ) -> Result<u32, ContainerError>;

    async fn start_task(&self, namespace: &str, id: &str) -> Result<(), ContainerError>;

    /// Registers for the task exit; must be called before `start_task`.
    async fn wait_task(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<oneshot::Receiver<TaskExit>, ContainerError>;

    /// Signals the task; `all` also signals every process in the container.
    async fn kill_task(
        &self,
        namespace: &str,
        id: &str,
        signal: Signal,
        all: bool,
    ) -> Result<(), ContainerError>;

    async fn delete_task(&self, namespace: &str, id: &str) -> Result<(), ContainerError>;

    /// Closes the task's stdin.
    async fn close_io(&self, namespace: &str, id: &str) -> Result<(), ContainerError>;

    async fn health_check(&self) -> Result<ServingStatus, ContainerError>;

    async fn close(&self) -> Result<(), ContainerError>;
}

#[async_trait]
pub trait ContainerConnector: Send + Sync {
    async fn connect(&self, address: &Path) -> Result<Arc<dyn ContainerClient>, ContainerError>;
}

/// Health probe of the container runtime that connects on first use.
pub struct RuntimeHealth {
    connector: Arc<dyn ContainerConnector>,
    address: PathBuf,
    client: Mutex<Option<Arc<dyn ContainerClient>>>,
}

impl RuntimeHealth {
    pub fn new(connector: Arc<dyn ContainerConnector>, address: impl Into<PathBuf>) -> Self {
        Self {
            connector,
            address: address.into(),
            client: Mutex::new(None),
        }
    }

    pub async fn check(&self) -> Result<(), BoxError> {
        let client = {
            let mut client = self.client.lock().await;
            match client.as_ref() {
                Some(existing) => Arc::clone(existing),
                None => {
                    let connected = self.connector.connect(&self.address).await?;
                    *client = Some(Arc::clone(&connected));
                    connected
                }
            }
        };

        match client.health_check().await? {
            ServingStatus::Serving => Ok(()),
            status => Err(format!("container runtime is not serving: {status:?}").into()),
        }
    }

    /// Drops the cached client, if any.
    pub async fn close(&self) -> Result<(), ContainerError> {
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    pub fn health_check(self: &Arc<Self>) -> HealthCheck {
        let health = Arc::clone(self);
        health_check(move |_| {
            let health = Arc::clone(&health);
            async move { health.check().await }
        })
    }
}
