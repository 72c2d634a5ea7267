//! btrfs implementation of the copy-on-write capability.
//!
//! Uses the `btrfs` command line tool for all operations.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::CowFs;
use crate::error::{Error, Result};

/// [`CowFs`] implementation over a btrfs mount.
pub struct Btrfs;

impl Btrfs {
    async fn run(args: &[&str]) -> Result<()> {
        debug!(?args, "running btrfs");

        let output = Command::new("btrfs")
            .args(args)
            .output()
            .await
            .map_err(|err| Error::Fs(format!("failed to run btrfs: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fs(format!(
                "btrfs {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl CowFs for Btrfs {
    async fn is_subvolume(&self, path: &Path) -> bool {
        Command::new("btrfs")
            .args(["subvolume", "show"])
            .arg(path)
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn create_subvolume(&self, path: &Path) -> Result<()> {
        Self::run(&["subvolume", "create", &path.to_string_lossy()]).await
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        Self::run(&["subvolume", "delete", &path.to_string_lossy()]).await
    }

    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        Self::run(&[
            "property",
            "set",
            "-ts",
            &path.to_string_lossy(),
            "ro",
            if readonly { "true" } else { "false" },
        ])
        .await
    }

    async fn snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        if !self.is_subvolume(src).await {
            return Err(Error::Fs(format!(
                "failed to create snapshot: '{}' is not a subvolume",
                src.display()
            )));
        }
        if tokio::fs::try_exists(dst).await? {
            return Err(Error::Fs(format!(
                "failed to create snapshot: '{}' already exists",
                dst.display()
            )));
        }

        let src = src.to_string_lossy();
        let dst = dst.to_string_lossy();
        if readonly {
            Self::run(&["subvolume", "snapshot", "-r", &src, &dst]).await?;
        } else {
            Self::run(&["subvolume", "snapshot", &src, &dst]).await?;
        }

        // Force changed blocks to disk and update the super block.
        let output = Command::new("sync")
            .output()
            .await
            .map_err(|err| Error::Fs(format!("failed to run sync: {err}")))?;
        if !output.status.success() {
            return Err(Error::Fs("sync failed after snapshot".to_string()));
        }

        Ok(())
    }

    async fn balance(&self, root: &Path, dusage: u32) -> Result<()> {
        Self::run(&[
            "filesystem",
            "balance",
            "start",
            &format!("-dusage={dusage}"),
            &root.to_string_lossy(),
        ])
        .await
    }
}
