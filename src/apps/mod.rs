//! App management: the process-wide registry and the App object with its
//! tasks, supervise loop and backup engine.

mod app;
mod backup;
mod clone;
mod control;
mod settings;
mod setup;
mod task;
mod update;

pub use app::App;
pub use settings::{PortSetting, Settings};
pub use setup::{Setup, SetupEnv, SetupPort};
pub use task::TaskKind;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::error;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::CowFs;
use crate::runtime::Runtime;
use crate::source::SourceFetcher;

/// The ordered set of all known apps.
///
/// Construction is explicit: the registry owns the capability handles and
/// hands them to every app it creates or loads.
pub struct Registry {
    config: Arc<Config>,
    fs: Arc<dyn CowFs>,
    runtime: Arc<dyn Runtime>,
    fetcher: Arc<dyn SourceFetcher>,

    apps: Mutex<BTreeMap<String, Arc<App>>>,
}

impl Registry {
    pub fn new(
        config: Arc<Config>,
        fs: Arc<dyn CowFs>,
        runtime: Arc<dyn Runtime>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            config,
            fs,
            runtime,
            fetcher,
            apps: Mutex::new(BTreeMap::new()),
        }
    }

    /// Read all apps from the apps directory. Every app directory has to
    /// be a subvolume.
    pub async fn load_apps(&self) -> Result<()> {
        let mut apps = self.apps.lock().await;
        apps.clear();

        let mut entries = tokio::fs::read_dir(self.config.app_path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            // The directory name is the app name.
            let name = entry.file_name().to_string_lossy().to_string();
            let app = App::load(
                &name,
                Arc::clone(&self.config),
                Arc::clone(&self.fs),
                Arc::clone(&self.runtime),
                Arc::clone(&self.fetcher),
            )
            .await?;

            apps.insert(name, app);
        }

        Ok(())
    }

    /// All apps, ordered by name.
    pub async fn apps(&self) -> Vec<Arc<App>> {
        self.apps.lock().await.values().cloned().collect()
    }

    /// Get an app by its name.
    pub async fn get(&self, name: &str) -> Result<Arc<App>> {
        if name.is_empty() {
            return Err(Error::Validation("get app: empty name passed".to_string()));
        }

        self.apps
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("an app with the name '{name}' does not exist")))
    }

    /// Register a new app: create its subvolume, persist the settings,
    /// and clone the source in a background task. Everything created is
    /// torn down again if any step fails.
    pub async fn add(&self, name: &str, source_url: &str, branch: &str) -> Result<()> {
        let mut apps = self.apps.lock().await;

        if apps.contains_key(name) {
            return Err(Error::Validation(format!(
                "an app with the name '{name}' already exists"
            )));
        }

        let settings = Settings {
            source_url: source_url.to_string(),
            branch: branch.to_string(),
            ..Default::default()
        };
        let app = App::new(
            name,
            settings,
            Arc::clone(&self.config),
            Arc::clone(&self.fs),
            Arc::clone(&self.runtime),
            Arc::clone(&self.fetcher),
        )?;

        if let Err(err) = self.prepare_app(&app).await {
            self.cleanup_failed_add(&app).await;
            return Err(err);
        }

        apps.insert(name.to_string(), app);
        Ok(())
    }

    async fn prepare_app(&self, app: &Arc<App>) -> Result<()> {
        self.fs.create_subvolume(app.path()).await?;
        app.save_settings().await?;
        tokio::fs::create_dir_all(app.source_dir()).await?;
        app.clone_source().await
    }

    async fn cleanup_failed_add(&self, app: &Arc<App>) {
        match tokio::fs::try_exists(app.path()).await {
            Ok(true) => {
                if let Err(err) = self.fs.delete_subvolume(app.path()).await {
                    error!(app = %app.name(), %err, "failed to clean up after a failed add");
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!(app = %app.name(), %err, "failed to clean up after a failed add");
            }
        }
    }

    /// Remove an app and unregister it. With `remove_backups` its backups
    /// are wiped too; otherwise a final backup is kept.
    pub async fn remove(&self, name: &str, remove_backups: bool) -> Result<()> {
        let app = self.get(name).await?;
        app.remove(remove_backups).await?;

        self.apps.lock().await.remove(name);
        Ok(())
    }

    /// Lock the registry for good. Part of daemon shutdown: no app can be
    /// resolved or added afterwards.
    pub async fn release(&self) {
        let guard = self.apps.lock().await;
        std::mem::forget(guard);
    }
}
