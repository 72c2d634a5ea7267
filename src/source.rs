//! Source fetcher capability.
//!
//! Clones and updates app source trees. Behind a trait so the core can be
//! exercised with a fake; the production implementation drives `git`.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Source repository operations required by the daemon.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone a single branch of `url` into `dest`.
    async fn clone_into(&self, url: &str, branch: &str, dest: &Path) -> Result<()>;

    /// Update a previously cloned tree in place.
    async fn pull(&self, dir: &Path) -> Result<()>;
}

/// [`SourceFetcher`] implementation over the `git` command line tool.
pub struct GitFetcher;

impl GitFetcher {
    async fn run(args: &[&str]) -> Result<()> {
        debug!(?args, "running git");

        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|err| Error::Source(format!("failed to run git: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Source(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn clone_into(&self, url: &str, branch: &str, dest: &Path) -> Result<()> {
        Self::run(&[
            "clone",
            "-b",
            branch,
            "--single-branch",
            url,
            &dest.to_string_lossy(),
        ])
        .await
    }

    async fn pull(&self, dir: &Path) -> Result<()> {
        Self::run(&["-C", &dir.to_string_lossy(), "pull"]).await
    }
}
