//! The app backup engine.
//!
//! Backups are immutable snapshots of the whole app subvolume, named by
//! their unix-seconds timestamp. Restores preserve the pre-restore state as
//! a fresh backup and roll back if anything fails half-way.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use super::app::App;
use super::task::TaskKind;
use crate::error::{Error, Result};

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_secs()
        .to_string()
}

impl App {
    /// Snapshot the app data. Allowed while the app is running (hot
    /// backup); forbidden while the source tree is being rewritten.
    pub async fn backup(&self) -> Result<()> {
        // The app must not start a task during the backup.
        let _gate = self.task_gate.lock().await;
        self.backup_locked().await
    }

    /// Snapshot the app data without taking the task gate. The caller must
    /// hold it.
    pub(crate) async fn backup_locked(&self) -> Result<()> {
        let task = *self.task.lock().unwrap();
        if task == TaskKind::CloneSource || task == TaskKind::Update {
            return Err(Error::Validation(format!(
                "can't backup app '{}' during a {task} task",
                self.name()
            )));
        }

        let backup_dir = self.backup_dir();
        tokio::fs::create_dir_all(&backup_dir).await?;

        let backup_path = backup_dir.join(unix_timestamp());

        info!(app = %self.name(), path = %backup_path.display(), "creating backup");

        self.fs.snapshot(self.path(), &backup_path, true).await
    }

    /// All backup timestamps of the app.
    pub async fn backups(&self) -> Result<Vec<String>> {
        let dir = self.backup_dir();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                backups.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        backups.sort();
        Ok(backups)
    }

    /// Remove one backup.
    pub async fn remove_backup(&self, timestamp: &str) -> Result<()> {
        let path = self.backup_dir().join(timestamp);

        if !self.fs.is_subvolume(&path).await {
            return Err(Error::NotFound(format!("no backup '{timestamp}' found")));
        }

        info!(app = %self.name(), backup = %timestamp, "removing backup");

        self.fs.delete_subvolume(&path).await
    }

    /// Remove every backup and the app's backup directory.
    pub async fn remove_all_backups(&self) -> Result<()> {
        for backup in self.backups().await? {
            self.remove_backup(&backup).await?;
        }

        let dir = self.backup_dir();
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }

        Ok(())
    }

    /// Restore a backup. The pre-restore state is preserved as a new
    /// backup; on failure the app subvolume is moved back into place so the
    /// restore is atomic from the caller's perspective.
    pub async fn restore_backup(&self, timestamp: &str) -> Result<()> {
        let _gate = self.task_gate.lock().await;

        if self.is_task_running() {
            return Err(Error::Busy);
        }

        let backup_path = self.backup_dir().join(timestamp);
        if !self.fs.is_subvolume(&backup_path).await {
            return Err(Error::NotFound(format!("no backup '{timestamp}' found")));
        }

        // The current data becomes a backup of its own.
        let preserved_path = self.backup_dir().join(unix_timestamp());

        info!(app = %self.name(), backup = %timestamp, "restoring backup");

        tokio::fs::rename(self.path(), &preserved_path).await?;

        let result = async {
            self.fs.set_readonly(&preserved_path, true).await?;
            self.fs.snapshot(&backup_path, self.path(), false).await
        }
        .await;

        if result.is_err() {
            // Move the preserved subvolume back and make it writable again.
            match tokio::fs::rename(&preserved_path, self.path()).await {
                Err(rollback_err) => {
                    error!(app = %self.name(), %rollback_err, "failed to restore the app's current subvolume");
                }
                Ok(()) => {
                    if let Err(flag_err) = self.fs.set_readonly(self.path(), false).await {
                        error!(app = %self.name(), %flag_err, "failed to restore the app's subvolume flag");
                    }
                }
            }
        }

        // The on-disk state changed either way; reload it. The protocol
        // error wins over a reload error.
        let reload_result = self.reload().await;
        result.and(reload_result)
    }
}
