//! Container runtime capability.
//!
//! The daemon drives containers through the [`Runtime`] trait so the core
//! can be exercised against an in-memory fake. The production
//! implementation wraps the `docker` command line client.

pub mod build;
mod docker;

pub use docker::DockerCli;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::error::Result;

/// Name prefix of every container managed by this daemon. Containers
/// without the prefix are never touched.
pub const TURTLE_PREFIX: &str = "turtle.";

/// Compose the runtime name of an app container.
pub fn container_name(app: &str, container: &str) -> String {
    format!("{TURTLE_PREFIX}{app}.{container}")
}

/// Shallow listing entry of a container.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Inspected container state.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
}

/// A host port published for a container port.
#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: String,
    pub host_port: u16,
}

/// Options for creating a container. The daemon always creates containers
/// with a no-restart policy; the supervise loop owns restarts.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    /// Image reference including the tag.
    pub image: String,
    pub hostname: String,
    pub domainname: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: String,
    pub dns: Vec<String>,
    pub network_disabled: bool,
    pub network_mode: String,
    /// `target-name:alias` pairs.
    pub links: Vec<String>,
    pub port_bindings: Vec<PortBinding>,
    /// `host-path:mount[:ro]` bind strings.
    pub binds: Vec<String>,
}

/// Image build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub pull: bool,
    pub rm_tmp_container: bool,
    pub force_rm_tmp_container: bool,
}

/// A container lifecycle event from the runtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeEvent {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub id: String,
}

/// Event subscriber callback. Must not block the event stream.
pub type EventHandler = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Container runtime operations required by the daemon.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;

    /// Find a container by its (globally unique) name.
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerDetails>>;

    /// Create a container and return its id.
    async fn create(&self, opts: &CreateOptions) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a container, killing it after the grace period.
    async fn stop(&self, id: &str, grace_seconds: u32) -> Result<()>;

    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    async fn image_exists(&self, reference: &str) -> Result<bool>;

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()>;

    async fn tag_image(&self, source: &str, repository: &str, tag: &str, force: bool)
    -> Result<()>;

    async fn remove_image(&self, reference: &str) -> Result<()>;

    /// Build an image from a tar archive of the build context, tagging it
    /// with the given reference.
    async fn build_image(&self, archive: Vec<u8>, reference: &str, opts: &BuildOptions)
    -> Result<()>;

    /// Fetch the container log streams. Only the requested streams are
    /// collected; the other string is left empty.
    async fn logs(&self, id: &str, stdout: bool, stderr: bool) -> Result<(String, String)>;

    /// Register an event listener and return its subscription id.
    fn subscribe(&self, handler: EventHandler) -> u64;

    /// Remove an event listener.
    fn unsubscribe(&self, id: u64);
}

/// Stop a container if it is alive, then remove it.
pub async fn stop_and_remove(runtime: &dyn Runtime, id: &str, grace_seconds: u32) -> Result<()> {
    let details = runtime.inspect(id).await?;

    if details.running || details.paused || details.restarting {
        runtime.stop(id, grace_seconds).await?;
    }

    runtime.remove(id, true).await
}

/// Stop and remove every container carrying the turtle name prefix.
/// Foreign containers are never touched.
pub async fn cleanup_turtle_containers(runtime: &dyn Runtime, grace_seconds: u32) -> Result<()> {
    let containers = runtime.list_containers(true).await?;

    for container in containers {
        let is_turtle = container
            .names
            .iter()
            .any(|name| name.trim_start_matches('/').starts_with(TURTLE_PREFIX));
        if !is_turtle {
            continue;
        }

        info!(id = %container.id, "removing leftover turtle container");
        stop_and_remove(runtime, &container.id, grace_seconds).await?;
    }

    Ok(())
}
