//! Copy-on-write filesystem capability.
//!
//! The daemon only ever talks to the filesystem through the [`CowFs`]
//! trait so the core can be exercised against an in-memory fake. The
//! production implementation drives the `btrfs` tool.

mod btrfs;

pub use btrfs::Btrfs;

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Copy-on-write filesystem operations required by the daemon.
#[async_trait]
pub trait CowFs: Send + Sync {
    /// Whether the directory is a subvolume.
    async fn is_subvolume(&self, path: &Path) -> bool;

    /// Create a new writable subvolume.
    async fn create_subvolume(&self, path: &Path) -> Result<()>;

    /// Delete a subvolume.
    async fn delete_subvolume(&self, path: &Path) -> Result<()>;

    /// Toggle the readonly flag of a subvolume.
    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()>;

    /// Snapshot `src` into `dst`. `src` must be a subvolume and `dst` must
    /// not exist. After success the dirty buffers are flushed to stable
    /// storage.
    async fn snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()>;

    /// Run periodic maintenance on the filesystem below `root`.
    async fn balance(&self, root: &Path, dusage: u32) -> Result<()>;
}

/// Write a file so that a crash leaves either the old or the new content:
/// write to a temporary sibling, then rename over the final path.
pub(crate) async fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let tmp = path.with_extension("tmp");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &path)?;
        Ok(())
    })
    .await
    .map_err(|err| Error::Fs(format!("atomic write worker failed: {err}")))?
}
