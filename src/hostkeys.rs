//! SSH host-key trust store.
//!
//! The daemon keeps its own known_hosts file under the turtle directory and
//! mirrors it into the effective user's `~/.ssh/known_hosts` so that git
//! clones over SSH trust exactly the hosts the operator registered.

use std::path::PathBuf;

use tokio::process::Command;

use crate::error::{Error, Result};

/// The persisted host-key trust store.
pub struct HostKeys {
    path: PathBuf,
}

impl HostKeys {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Copy the persisted known_hosts file over the user's
    /// `~/.ssh/known_hosts`. A missing store file is not an error.
    pub async fn populate_known_hosts(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        let home = std::env::var("HOME")
            .map_err(|_| Error::Validation("HOME is not set".to_string()))?;
        let ssh_dir = PathBuf::from(home).join(".ssh");
        tokio::fs::create_dir_all(&ssh_dir).await?;

        tokio::fs::copy(&self.path, ssh_dir.join("known_hosts")).await?;
        Ok(())
    }

    /// Whether a fingerprint for the host is already trusted.
    pub async fn fingerprint_exists(&self, host: &str) -> Result<bool> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }

        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(contents
            .lines()
            .any(|line| line.trim_start().starts_with(host)))
    }

    /// Append a fingerprint to the store and repopulate the user file.
    pub async fn add_fingerprint(&self, fingerprint: &str) -> Result<()> {
        if fingerprint.is_empty() {
            return Err(Error::Validation(
                "failed to add host fingerprint: empty fingerprint".to_string(),
            ));
        }

        let mut contents = if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::read_to_string(&self.path).await?
        } else {
            String::new()
        };
        contents.push('\n');
        contents.push_str(fingerprint);

        crate::fs::atomic_write(&self.path, contents.as_bytes(), 0o600).await?;

        self.populate_known_hosts().await
    }

    /// Obtain the SSH fingerprint of a host via `ssh-keyscan`.
    pub async fn scan_fingerprint(&self, host: &str) -> Result<String> {
        let output = Command::new("ssh-keyscan")
            .arg(host)
            .output()
            .await
            .map_err(|err| Error::Source(format!("failed to run ssh-keyscan: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Source(stderr.trim().to_string()));
        }

        let fingerprint = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if fingerprint.is_empty() {
            return Err(Error::Source(
                "failed to obtain host fingerprint: is this a valid host?".to_string(),
            ));
        }

        Ok(fingerprint)
    }
}
