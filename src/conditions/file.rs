use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Condition, all};
use crate::{constants::FILE_POLL_INTERVAL, error::ConditionError, util};

/// Satisfied once a path exists.
pub struct FileExists {
    path: PathBuf,
    interval: Duration,
}

impl FileExists {
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
}

impl fmt::Display for FileExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file {:?} to exist", self.path)
    }
}

#[async_trait]
impl Condition for FileExists {
    async fn wait(&self, ctx: &CancellationToken) -> Result<(), ConditionError> {
        loop {
            if exists(&self.path).await? {
                return Ok(());
            }
            util::sleep(ctx, self.interval).await?;
        }
    }
}

/// Like [`Path::try_exists`], but only "not found" counts as absent.
pub(super) async fn exists(path: &Path) -> Result<bool, io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

pub fn wait_for_file_to_exist(path: impl Into<PathBuf>) -> Arc<dyn Condition> {
    Arc::new(FileExists::new(path))
}

pub fn wait_for_files_to_exist<P: Into<PathBuf>>(
    paths: impl IntoIterator<Item = P>,
) -> Arc<dyn Condition> {
    all(paths.into_iter().map(wait_for_file_to_exist))
}
