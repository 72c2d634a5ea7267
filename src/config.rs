//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the turtle daemon.
///
/// The defaults mirror a production deployment on a btrfs root mounted at
/// `/turtle`; the integration tests shrink the timing knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address for the request dispatcher.
    pub listen_address: String,

    /// Root directory. Must live on the copy-on-write filesystem.
    pub turtle_root: PathBuf,

    /// Interval between automatic hot backups of a running app.
    pub backup_interval: Duration,
    /// Interval of the backup retention sweep. The sweep itself runs at
    /// half this interval.
    pub remove_backup_interval: Duration,
    /// Backups older than this are removed by the retention sweep.
    pub keep_backups_duration: Duration,

    /// Interval of the filesystem balance job (runs at half this interval).
    pub balance_interval: Duration,
    /// `dusage` threshold for the balance job, in percent.
    pub balance_dusage: u32,

    /// Grace period before a stopping container is killed.
    pub stop_grace_seconds: u32,
    /// Delay after starting a container when the manifest does not set one.
    pub container_wait_default: Duration,
    /// Settle window between starting all containers and arming the watcher.
    pub settle_after_start: Duration,
    /// Cool-down between a teardown and the restart that follows it.
    pub restart_cooldown: Duration,
    /// Restart attempts before the run task fails with the container logs.
    pub max_restart_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:28239".to_string(),
            turtle_root: PathBuf::from("/turtle"),

            backup_interval: Duration::from_secs(4 * 3600),
            remove_backup_interval: Duration::from_secs(5 * 3600),
            keep_backups_duration: Duration::from_secs(7 * 24 * 3600),

            balance_interval: Duration::from_secs(3 * 3600),
            balance_dusage: 20,

            stop_grace_seconds: 10,
            container_wait_default: Duration::from_millis(300),
            settle_after_start: Duration::from_secs(3),
            restart_cooldown: Duration::from_millis(300),
            max_restart_retries: 3,
        }
    }
}

impl Config {
    /// Directory holding one subvolume per app.
    pub fn app_path(&self) -> PathBuf {
        self.turtle_root.join("apps")
    }

    /// Directory holding the per-app backup directories.
    pub fn backup_path(&self) -> PathBuf {
        self.turtle_root.join("backups")
    }

    /// Directory holding the daemon's own files (state, known hosts).
    pub fn turtle_path(&self) -> PathBuf {
        self.turtle_root.join("turtle")
    }

    /// File recording the apps that were running at shutdown.
    pub fn state_file_path(&self) -> PathBuf {
        self.turtle_path().join("state")
    }

    /// The daemon's persisted known_hosts file.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.turtle_path().join("known_hosts")
    }
}
