//! App setup: the operator-facing view of the tunable environment
//! variables and port mappings, and applying new values.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::app::App;
use super::settings::PortSetting;
use crate::error::{Error, Result};

/// The setup values of an app as exchanged with clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Setup {
    pub env: Vec<SetupEnv>,
    pub ports: Vec<SetupPort>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetupEnv {
    pub name: String,
    pub value: String,
    pub required: bool,
    pub description: String,
    pub default: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetupPort {
    pub container: String,
    pub port: i64,
    pub protocol: String,
    /// 0 disables the mapping.
    pub host_port: i64,
    pub description: String,
}

impl App {
    /// Whether every required environment variable has a value.
    pub async fn is_setup(&self) -> bool {
        let manifest = match self.manifest().await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(app = %self.name(), %err, "is_setup");
                return false;
            }
        };

        let settings = self.settings.lock().unwrap();
        for env in &manifest.env {
            if !env.required {
                continue;
            }
            match settings.env.get(&env.name) {
                Some(value) if !value.is_empty() => {}
                _ => return false,
            }
        }

        true
    }

    /// The current setup values: manifest declarations overlaid with the
    /// persisted settings.
    pub async fn get_setup(&self) -> Result<Setup> {
        let manifest = self.manifest().await?;
        let settings = self.settings.lock().unwrap().clone();

        let env = manifest
            .env
            .iter()
            .map(|env| SetupEnv {
                name: env.name.clone(),
                value: settings.env.get(&env.name).cloned().unwrap_or_default(),
                required: env.required,
                description: env.description.clone(),
                default: env.default.clone(),
            })
            .collect();

        let ports = manifest
            .ports
            .iter()
            .map(|port| {
                let host_port = settings
                    .ports
                    .iter()
                    .find(|s| {
                        s.container_name == port.container
                            && i64::from(s.container_port) == port.port
                            && s.protocol == port.protocol
                    })
                    .map(|s| i64::from(s.host_port))
                    .unwrap_or(0);

                SetupPort {
                    container: port.container.clone(),
                    port: port.port,
                    protocol: port.protocol.clone(),
                    host_port,
                    description: port.description.clone(),
                }
            })
            .collect();

        Ok(Setup { env, ports })
    }

    /// Apply new setup values and persist them.
    pub async fn set_setup(&self, setup: &Setup) -> Result<()> {
        for port in &setup.ports {
            if port.host_port < 0 || port.host_port > 65_535 {
                return Err(Error::Validation(format!(
                    "invalid host port: {}",
                    port.host_port
                )));
            }
            if port.port <= 0 || port.port > 65_535 {
                return Err(Error::Validation(format!("invalid port: {}", port.port)));
            }
        }

        // Keep a snapshot of the pre-setup state.
        self.backup().await?;

        {
            let mut settings = self.settings.lock().unwrap();

            settings.env.clear();
            for env in &setup.env {
                settings.env.insert(env.name.clone(), env.value.clone());
            }

            settings.ports = setup
                .ports
                .iter()
                .map(|port| PortSetting {
                    container_name: port.container.clone(),
                    container_port: port.port as u16,
                    host_port: port.host_port as u16,
                    protocol: port.protocol.clone(),
                })
                .collect();
        }

        self.save_settings().await
    }
}
