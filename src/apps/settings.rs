//! Persisted per-app settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The app settings record, stored TOML-encoded in the app's settings file.
///
/// Unknown fields are tolerated on load so the format can grow without a
/// migration step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    /// The git source URL.
    #[serde(rename = "SourceURL")]
    pub source_url: String,
    /// Branch to clone and track.
    pub branch: String,
    /// User-set environment values, keyed by variable name.
    pub env: HashMap<String, String>,
    /// Host port assignments, in setup order.
    pub ports: Vec<PortSetting>,
}

/// One published port. A host port of 0 means the mapping is disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortSetting {
    pub container_name: String,
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}
