//! Daemon state persistence.
//!
//! At shutdown the names of all running apps are written to the state
//! file; at startup those apps are started again.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::apps::Registry;
use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DaemonState {
    /// Names of all apps in the run task.
    running_apps: Vec<String>,
}

/// Save the names of the currently running apps.
pub async fn save_state(registry: &Registry, config: &Config) -> Result<()> {
    let mut state = DaemonState::default();

    for app in registry.apps().await {
        if app.is_running() {
            state.running_apps.push(app.name().to_string());
        }
    }

    let encoded = toml::to_string(&state)
        .map_err(|err| Error::Validation(format!("failed to encode daemon state: {err}")))?;

    crate::fs::atomic_write(&config.state_file_path(), encoded.as_bytes(), 0o600).await
}

/// Start every app that was running during the previous shutdown. A
/// missing state file is not an error; per-app start failures are
/// aggregated so one bad app does not block the rest.
pub async fn restore_state(registry: &Registry, config: &Config) -> Result<()> {
    let path = config.state_file_path();
    if !tokio::fs::try_exists(&path).await? {
        return Ok(());
    }

    let raw = tokio::fs::read_to_string(&path).await?;
    let state: DaemonState = toml::from_str(&raw).map_err(|err| {
        Error::Validation(format!(
            "failed to load daemon state file '{}': {err}",
            path.display()
        ))
    })?;

    let mut errors = Vec::new();

    for name in &state.running_apps {
        let app = match registry.get(name).await {
            Ok(app) => app,
            // The app may have been removed since the state was written.
            Err(_) => continue,
        };

        if app.is_running() {
            continue;
        }

        info!(app = %name, "restoring previously running app");

        if let Err(err) = app.start().await {
            errors.push(format!("failed to start app '{name}': {err}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Multi(errors))
    }
}
