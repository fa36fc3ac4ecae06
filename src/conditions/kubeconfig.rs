use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Condition, file::exists};
use crate::{constants::FILE_POLL_INTERVAL, error::ConditionError, util};

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(rename = "client-certificate")]
    client_certificate: Option<PathBuf>,
    #[serde(rename = "client-key")]
    client_key: Option<PathBuf>,
}

impl Kubeconfig {
    fn referenced_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.clusters
            .iter()
            .filter_map(|c| c.cluster.certificate_authority.as_ref())
            .chain(self.users.iter().flat_map(|u| {
                u.user
                    .client_certificate
                    .iter()
                    .chain(u.user.client_key.iter())
            }))
    }
}

/// Satisfied once a kubeconfig exists, parses, names a server and every
/// file it references is present.
pub struct KubeconfigReady {
    path: PathBuf,
    interval: Duration,
}

impl KubeconfigReady {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: FILE_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn ready(&self) -> Result<bool, ConditionError> {
        if !exists(&self.path).await? {
            return Ok(false);
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let config: Kubeconfig = match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                debug!("kubeconfig {:?} not parseable yet: {err}", self.path);
                return Ok(false);
            }
        };

        if config.clusters.iter().all(|c| c.cluster.server.is_empty()) {
            return Ok(false);
        }

        let base = self.path.parent().unwrap_or(Path::new("/"));
        for file in config.referenced_files() {
            if !exists(&base.join(file)).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl fmt::Display for KubeconfigReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kubeconfig {:?} to be ready", self.path)
    }
}

#[async_trait]
impl Condition for KubeconfigReady {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        loop {
            if self.ready().await? {
                return Ok(());
            }
            util::sleep(ctx, self.interval).await?;
        }
    }
}

pub fn wait_for_kubeconfig_ready(path: impl Into<PathBuf>) -> Arc<dyn Condition> {
    Arc::new(KubeconfigReady::new(path))
}
