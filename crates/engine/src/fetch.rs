//! Repository fetching.
//!
//! Clones are staged into a unique directory per deploy attempt and removed
//! on every exit path, successful or not.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use derive_more::{Display, Error, From};
use time::OffsetDateTime;
use tokio::process::Command;
use tracing::warn;

use crate::naming;

/// Repository fetch errors.
#[derive(Debug, Display, Error, From)]
pub enum FetchError {
    /// IO-related error.
    Io(io::Error),

    /// `git clone` exited unsuccessfully.
    #[display(fmt = "unable to clone repository")]
    CloneFailed,
}

/// Source used to populate a build context directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `url` into the empty directory `dest`, blocking until complete.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), FetchError>;
}

/// [`SourceFetcher`] that shells out to `git clone`.
pub struct GitFetcher;

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let clone = Command::new("git")
            .arg("clone")
            .arg(url)
            .arg(dest)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()
            .await?;

        if !clone.success() {
            return Err(FetchError::CloneFailed);
        }

        Ok(())
    }
}

/// Staging directory of a single deploy attempt.
pub(crate) struct CloneDir {
    path: PathBuf,
}

impl CloneDir {
    /// Pick a unique `project-{epoch-ms}-{slug}` path under `root`.
    pub(crate) fn unique(root: &Path, url: &str) -> Self {
        let epoch_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;

        Self {
            path: root.join(format!("project-{}-{}", epoch_ms, naming::repo_slug(url))),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the staging directory. Failures are logged and swallowed.
    pub(crate) async fn remove(self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.path).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "unable to remove clone directory");
            }
        }
    }
}
