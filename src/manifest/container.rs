//! Container entries of the app manifest.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default image tag when the manifest does not set one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Default container network mode.
pub const DEFAULT_NETWORK_MODE: &str = "bridge";

const MAX_WAIT_AFTER_STARTUP_MS: i64 = 20_000;
const READONLY_VOLUME_SUFFIX: &str = ":ro";

/// One container of an app.
///
/// If the image starts with a dot it is built from that subpath of the
/// app's source tree instead of being pulled from a registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default, deny_unknown_fields)]
pub struct Container {
    pub name: String,
    pub image: String,

    pub tag: String,
    /// Delay in milliseconds after this container started, before the next
    /// container is launched. 0 selects the daemon default.
    pub wait_after_startup: i64,
    pub links: Vec<String>,
    /// Volume mount points. A trailing `:ro` marks a read-only mount.
    pub volumes: Vec<String>,
    /// Pre-composed bind strings passed to the runtime verbatim.
    pub static_volumes: Vec<String>,
    /// Static `VAR=value` pairs, exported before the projected variables.
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    #[serde(rename = "DNS")]
    pub dns: Vec<String>,
    pub hostname: String,
    pub domainname: String,
    pub network_disabled: bool,
    #[serde(rename = "Net")]
    pub network_mode: String,
}

impl Container {
    pub(super) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Manifest("container name is empty".to_string()));
        }
        if self.image.is_empty() {
            return Err(Error::Manifest(format!(
                "container '{}': image is empty",
                self.name
            )));
        }
        if self.image.contains(':') || self.image.contains("..") {
            return Err(Error::Manifest(format!(
                "container '{}': image '{}' contains an invalid character",
                self.name, self.image
            )));
        }
        if self.wait_after_startup < 0 || self.wait_after_startup > MAX_WAIT_AFTER_STARTUP_MS {
            return Err(Error::Manifest(format!(
                "container '{}': WaitAfterStartup '{}' is out of range",
                self.name, self.wait_after_startup
            )));
        }

        for volume in &self.volumes {
            let stripped = volume
                .strip_suffix(READONLY_VOLUME_SUFFIX)
                .unwrap_or(volume);
            if stripped.contains(':') {
                return Err(Error::Manifest(format!(
                    "container '{}': volume '{volume}' contains invalid character ':'",
                    self.name
                )));
            }
            if volume.contains("..") {
                return Err(Error::Manifest(format!(
                    "container '{}': volume '{volume}' contains invalid character '..'",
                    self.name
                )));
            }
        }

        Ok(())
    }

    pub(super) fn fill_defaults(&mut self) {
        if self.tag.is_empty() {
            self.tag = DEFAULT_IMAGE_TAG.to_string();
        }
        if self.network_mode.is_empty() {
            self.network_mode = DEFAULT_NETWORK_MODE.to_string();
        }
    }

    /// Whether the image is built locally from the app source tree.
    pub fn is_local_build(&self) -> bool {
        self.image.starts_with('.')
    }

    /// Build context directory for a local-build image.
    pub fn build_path(&self, source_path: &Path) -> PathBuf {
        let tail = self.image.trim_start_matches('.').trim_start_matches('/');
        source_path.join(tail)
    }

    /// The mount point of a volume entry, without the `:ro` suffix.
    pub fn volume_mount_point(volume: &str) -> &str {
        volume.strip_suffix(READONLY_VOLUME_SUFFIX).unwrap_or(volume)
    }

    /// Compose the runtime bind strings for this container. Each declared
    /// volume is backed by a host directory under
    /// `<volumes_root>/<container>/`; the `:ro` suffix flows through to the
    /// runtime. Static volumes are passed verbatim.
    pub fn volume_binds(&self, volumes_root: &Path) -> Vec<String> {
        let base = volumes_root.join(&self.name);
        let mut binds = Vec::with_capacity(self.volumes.len() + self.static_volumes.len());

        for volume in &self.volumes {
            let mount = Self::volume_mount_point(volume);
            let host = base.join(mount.trim_start_matches('/'));
            binds.push(format!("{}:{}", host.display(), volume));
        }
        for volume in &self.static_volumes {
            binds.push(volume.clone());
        }

        binds
    }
}
