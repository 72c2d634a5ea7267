//! Environment variable entries of the app manifest.

use serde::Deserialize;

use crate::error::{Error, Result};

/// A user-tunable environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct EnvVar {
    pub name: String,

    /// Additional names the value is exported under.
    pub alias: Vec<String>,
    /// Whether the app can start without a value.
    pub required: bool,
    /// Setup text shown to the operator.
    pub description: String,
    /// Default value when the settings do not override it.
    pub default: String,
    /// Restrict the export to these containers. Empty means every container.
    pub containers: Vec<String>,
}

impl EnvVar {
    pub(super) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Manifest("environment name is empty".to_string()));
        }
        Ok(())
    }
}
