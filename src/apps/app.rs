//! The App object: identity, persisted settings, manifest cache and the
//! volatile task/run state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use super::settings::Settings;
use super::task::{STATE_IDLE, TaskKind};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::CowFs;
use crate::manifest::{MANIFEST_FILENAME, Manifest};
use crate::runtime::{Runtime, TURTLE_PREFIX};
use crate::source::SourceFetcher;

const SETTINGS_FILENAME: &str = "settings";
const SOURCE_DIRECTORY: &str = "source";
const VOLUMES_DIRECTORY: &str = "volumes";

/// A named bundle of cooperating containers under a single manifest.
pub struct App {
    name: String,
    path: PathBuf,

    pub(crate) config: Arc<Config>,
    pub(crate) fs: Arc<dyn CowFs>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) fetcher: Arc<dyn SourceFetcher>,

    pub(crate) settings: Mutex<Settings>,
    manifest: AsyncMutex<Option<Arc<Manifest>>>,

    /// Serializes task transitions and every operation that must exclude a
    /// task from starting (backup, restore, remove).
    pub(crate) task_gate: AsyncMutex<()>,
    pub(crate) task: Mutex<TaskKind>,
    pub(crate) task_err: Mutex<Option<Error>>,
    state: Mutex<String>,

    /// Ids of the live containers, in startup order.
    pub(crate) container_ids: Mutex<Vec<String>>,
    pub(crate) restart_requested: AtomicBool,

    pub(crate) check_restart_running: Mutex<bool>,
    pub(crate) check_restart_err_tx: Mutex<Option<mpsc::Sender<Error>>>,

    /// Present while the run task is stoppable; taken exactly once by
    /// `Stop()`.
    pub(crate) stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl App {
    /// Create a new app value. The name must be non-empty and free of
    /// whitespace.
    pub(super) fn new(
        name: &str,
        settings: Settings,
        config: Arc<Config>,
        fs: Arc<dyn CowFs>,
        runtime: Arc<dyn Runtime>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Arc<App>> {
        if name.is_empty() {
            return Err(Error::Validation("the app name is empty".to_string()));
        }
        if name
            .chars()
            .any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '\x0c' | '\r'))
        {
            return Err(Error::Validation(format!(
                "the app name '{name}' contains a whitespace"
            )));
        }

        let path = config.app_path().join(name);

        Ok(Arc::new(App {
            name: name.to_string(),
            path,
            config,
            fs,
            runtime,
            fetcher,
            settings: Mutex::new(settings),
            manifest: AsyncMutex::new(None),
            task_gate: AsyncMutex::new(()),
            task: Mutex::new(TaskKind::None),
            task_err: Mutex::new(None),
            state: Mutex::new(STATE_IDLE.to_string()),
            container_ids: Mutex::new(Vec::new()),
            restart_requested: AtomicBool::new(false),
            check_restart_running: Mutex::new(false),
            check_restart_err_tx: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }))
    }

    /// Load an existing app from the apps directory. The app directory has
    /// to be a subvolume.
    pub(super) async fn load(
        name: &str,
        config: Arc<Config>,
        fs: Arc<dyn CowFs>,
        runtime: Arc<dyn Runtime>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Arc<App>> {
        let app = App::new(name, Settings::default(), config, fs, runtime, fetcher)?;

        if !app.fs.is_subvolume(&app.path).await {
            return Err(Error::Fs(format!(
                "the app directory '{}' is not a subvolume",
                app.path.display()
            )));
        }

        app.load_settings().await?;

        Ok(app)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name prefix of all containers belonging to this app.
    pub fn container_name_prefix(&self) -> String {
        format!("{TURTLE_PREFIX}{}.", self.name)
    }

    pub fn source_url(&self) -> String {
        self.settings.lock().unwrap().source_url.clone()
    }

    pub fn branch(&self) -> String {
        self.settings.lock().unwrap().branch.clone()
    }

    pub fn settings_file_path(&self) -> PathBuf {
        self.path.join(SETTINGS_FILENAME)
    }

    pub fn source_dir(&self) -> PathBuf {
        self.path.join(SOURCE_DIRECTORY)
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.path.join(VOLUMES_DIRECTORY)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.config.backup_path().join(&self.name)
    }

    /// The app's manifest, loaded from the source tree on first use and
    /// cached until the source changes.
    pub async fn manifest(&self) -> Result<Arc<Manifest>> {
        let mut cached = self.manifest.lock().await;
        if let Some(manifest) = cached.as_ref() {
            return Ok(Arc::clone(manifest));
        }

        let mut path = self.source_dir().join(MANIFEST_FILENAME);
        let meta = tokio::fs::metadata(&path).await.map_err(|_| {
            Error::Manifest("manifest is missing in the source directory".to_string())
        })?;

        // The manifest path may be a directory carrying the manifest file.
        if meta.is_dir() {
            path = path.join(MANIFEST_FILENAME);
            if !tokio::fs::try_exists(&path).await? {
                return Err(Error::Manifest(
                    "manifest is missing in the source directory".to_string(),
                ));
            }
        }

        let manifest = Arc::new(Manifest::load(&path).await?);
        *cached = Some(Arc::clone(&manifest));

        Ok(manifest)
    }

    /// Drop the cached manifest so the next access reloads it.
    pub(crate) async fn invalidate_manifest(&self) {
        *self.manifest.lock().await = None;
    }

    /// The app's container names, in start order.
    pub async fn containers(&self) -> Result<Vec<String>> {
        let manifest = self.manifest().await?;
        Ok(manifest.containers.iter().map(|c| c.name.clone()).collect())
    }

    /// Ids of the currently live containers, in startup order.
    pub fn container_ids(&self) -> Vec<String> {
        self.container_ids.lock().unwrap().clone()
    }

    /// Whether the run task is active.
    pub fn is_running(&self) -> bool {
        *self.task.lock().unwrap() == TaskKind::Run
    }

    /// Whether any task is active.
    pub fn is_task_running(&self) -> bool {
        *self.task.lock().unwrap() != TaskKind::None
    }

    /// The error of the last task, if it failed.
    pub fn last_error(&self) -> Option<String> {
        self.task_err
            .lock()
            .unwrap()
            .as_ref()
            .map(|err| err.to_string())
    }

    /// The app's current state string.
    pub fn state(&self) -> String {
        self.state.lock().unwrap().clone()
    }

    pub(crate) fn set_state(&self, state: &str) {
        *self.state.lock().unwrap() = state.to_string();
    }

    /// Project the manifest environment for one container, taking user-set
    /// values over defaults. Static container env is not included.
    pub(crate) async fn project_env(&self, container_name: &str) -> Result<Vec<String>> {
        let manifest = self.manifest().await?;
        let user_env: HashMap<String, String> = self.settings.lock().unwrap().env.clone();
        Ok(manifest.env_for(container_name, &user_env))
    }

    /// Persist the settings record. The write is atomic: a crash leaves
    /// either the old or the new file.
    pub(crate) async fn save_settings(&self) -> Result<()> {
        let settings = self.settings.lock().unwrap().clone();
        let encoded = toml::to_string(&settings).map_err(|err| {
            Error::Validation(format!("failed to encode app settings: {err}"))
        })?;

        crate::fs::atomic_write(&self.settings_file_path(), encoded.as_bytes(), 0o600).await
    }

    pub(crate) async fn load_settings(&self) -> Result<()> {
        let path = self.settings_file_path();
        let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
            Error::Validation(format!(
                "failed to load app settings file '{}': {err}",
                path.display()
            ))
        })?;

        let settings: Settings = toml::from_str(&raw).map_err(|err| {
            Error::Validation(format!(
                "failed to decode app settings file '{}': {err}",
                path.display()
            ))
        })?;

        *self.settings.lock().unwrap() = settings;
        Ok(())
    }

    /// Reload the settings and manifest from disk.
    pub(crate) async fn reload(&self) -> Result<()> {
        self.invalidate_manifest().await;
        self.manifest().await?;
        self.load_settings().await
    }

    /// Remove the app's data. With `remove_backups` the backups are wiped
    /// too; otherwise a final backup is taken first.
    pub(crate) async fn remove(&self, remove_backups: bool) -> Result<()> {
        let _gate = self.task_gate.lock().await;

        if self.is_task_running() {
            return Err(Error::Busy);
        }

        if !remove_backups {
            // Keep a final copy of the data before it disappears.
            self.backup_locked().await?;
        }

        if tokio::fs::try_exists(&self.path).await? {
            self.fs.delete_subvolume(&self.path).await?;
        }

        if remove_backups {
            self.remove_all_backups().await?;
        }

        Ok(())
    }
}
