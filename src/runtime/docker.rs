//! Docker implementation of the runtime capability.
//!
//! Wraps the `docker` command line client; the event stream is tailed from
//! `docker events` and fanned out to the registered subscribers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, warn};

use super::{
    BuildOptions, ContainerDetails, ContainerSummary, CreateOptions, EventHandler, Runtime,
    RuntimeEvent,
};
use crate::error::{Error, Result};

/// [`Runtime`] implementation over the `docker` CLI.
pub struct DockerCli {
    subscribers: Mutex<HashMap<u64, EventHandler>>,
    subscriber_counter: Mutex<u64>,
}

impl DockerCli {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            subscriber_counter: Mutex::new(0),
        })
    }

    /// Start tailing `docker events` in the background. The child is
    /// respawned if the stream ends.
    pub fn start_event_listener(self: &Arc<Self>) {
        let runtime = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                if let Err(err) = runtime.tail_events().await {
                    warn!(%err, "docker event stream failed");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    async fn tail_events(&self) -> Result<()> {
        let mut child = Command::new("docker")
            .args(["events", "--format", "{{json .}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::Runtime(format!("failed to run docker events: {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Runtime("docker events has no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| Error::Runtime(format!("docker events read failed: {err}")))?
        {
            let Some(event) = parse_event(&line) else {
                continue;
            };
            self.dispatch(&event);
        }

        let _ = child.wait().await;
        Err(Error::Runtime("docker event stream ended".to_string()))
    }

    /// Fan an event out to all subscribers. Events are dispatched under the
    /// mutex so listeners observe a consistent snapshot; a panicking
    /// listener is recovered and logged.
    fn dispatch(&self, event: &RuntimeEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        for handler in subscribers.values() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(event);
            }));
            if result.is_err() {
                error!(id = %event.id, status = %event.status, "event listener panicked");
            }
        }
    }

    async fn run(args: Vec<String>) -> Result<String> {
        debug!(?args, "running docker");

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|err| Error::Runtime(format!("failed to run docker: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn parse_event(line: &str) -> Option<RuntimeEvent> {
    #[derive(Deserialize, Default)]
    struct RawActor {
        #[serde(rename = "ID", default)]
        id: String,
    }

    #[derive(Deserialize)]
    struct RawEvent {
        #[serde(default)]
        status: String,
        #[serde(default)]
        id: String,
        #[serde(rename = "Type", default)]
        kind: String,
        #[serde(rename = "Action", default)]
        action: String,
        #[serde(rename = "Actor", default)]
        actor: RawActor,
    }

    let raw: RawEvent = serde_json::from_str(line).ok()?;

    if !raw.kind.is_empty() && raw.kind != "container" {
        return None;
    }

    let status = if raw.status.is_empty() {
        raw.action
    } else {
        raw.status
    };
    let id = if raw.id.is_empty() { raw.actor.id } else { raw.id };
    if status.is_empty() || id.is_empty() {
        return None;
    }

    Some(RuntimeEvent { status, id })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    name: String,
    state: InspectedState,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
struct InspectedState {
    running: bool,
    paused: bool,
    restarting: bool,
}

impl From<InspectedContainer> for ContainerDetails {
    fn from(c: InspectedContainer) -> Self {
        ContainerDetails {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            running: c.state.running,
            paused: c.state.paused,
            restarting: c.state.restarting,
        }
    }
}

#[async_trait]
impl Runtime for DockerCli {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        #[derive(Deserialize)]
        struct PsLine {
            #[serde(rename = "ID")]
            id: String,
            #[serde(rename = "Names", default)]
            names: String,
        }

        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        args.push("--format".to_string());
        args.push("{{json .}}".to_string());

        let stdout = Self::run(args).await?;

        let mut containers = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let ps: PsLine = serde_json::from_str(line)
                .map_err(|err| Error::Runtime(format!("failed to parse docker ps output: {err}")))?;
            containers.push(ContainerSummary {
                id: ps.id,
                names: ps.names.split(',').map(|n| n.trim().to_string()).collect(),
            });
        }

        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let stdout = Self::run(vec!["inspect".to_string(), id.to_string()]).await?;

        let mut inspected: Vec<InspectedContainer> = serde_json::from_str(&stdout)
            .map_err(|err| Error::Runtime(format!("failed to parse docker inspect output: {err}")))?;
        let container = inspected
            .pop()
            .ok_or_else(|| Error::Runtime(format!("container not found: {id}")))?;

        Ok(container.into())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerDetails>> {
        let containers = self.list_containers(true).await?;

        for container in containers {
            let matches = container
                .names
                .iter()
                .any(|n| n.trim_start_matches('/') == name);
            if matches {
                return self.inspect(&container.id).await.map(Some);
            }
        }

        Ok(None)
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            opts.name.clone(),
            "--restart".to_string(),
            "no".to_string(),
        ];

        for link in &opts.links {
            args.push("--link".to_string());
            args.push(link.clone());
        }
        for binding in &opts.port_bindings {
            args.push("-p".to_string());
            args.push(format!(
                "{}:{}/{}",
                binding.host_port, binding.container_port, binding.protocol
            ));
        }
        for bind in &opts.binds {
            args.push("-v".to_string());
            args.push(bind.clone());
        }
        for env in &opts.env {
            args.push("-e".to_string());
            args.push(env.clone());
        }
        for dns in &opts.dns {
            args.push("--dns".to_string());
            args.push(dns.clone());
        }
        if !opts.hostname.is_empty() {
            args.push("--hostname".to_string());
            args.push(opts.hostname.clone());
        }
        if !opts.domainname.is_empty() {
            args.push("--domainname".to_string());
            args.push(opts.domainname.clone());
        }
        if !opts.working_dir.is_empty() {
            args.push("--workdir".to_string());
            args.push(opts.working_dir.clone());
        }
        if opts.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        } else if !opts.network_mode.is_empty() {
            args.push("--network".to_string());
            args.push(opts.network_mode.clone());
        }

        // The CLI only takes a single entrypoint value; the remaining
        // elements are passed ahead of the command.
        let mut trailing = Vec::new();
        if let Some((first, rest)) = opts.entrypoint.split_first() {
            args.push("--entrypoint".to_string());
            args.push(first.clone());
            trailing.extend(rest.iter().cloned());
        }

        args.push(opts.image.clone());
        trailing.extend(opts.cmd.iter().cloned());
        args.extend(trailing);

        Self::run(args).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        Self::run(vec!["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace_seconds: u32) -> Result<()> {
        Self::run(vec![
            "stop".to_string(),
            "-t".to_string(),
            grace_seconds.to_string(),
            id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id.to_string());
        Self::run(args).await?;
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args(["image", "inspect", reference])
            .output()
            .await
            .map_err(|err| Error::Runtime(format!("failed to run docker: {err}")))?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        Self::run(vec!["pull".to_string(), format!("{repository}:{tag}")]).await?;
        Ok(())
    }

    async fn tag_image(
        &self,
        source: &str,
        repository: &str,
        tag: &str,
        _force: bool,
    ) -> Result<()> {
        Self::run(vec![
            "tag".to_string(),
            source.to_string(),
            format!("{repository}:{tag}"),
        ])
        .await?;
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        Self::run(vec!["rmi".to_string(), reference.to_string()]).await?;
        Ok(())
    }

    async fn build_image(
        &self,
        archive: Vec<u8>,
        reference: &str,
        opts: &BuildOptions,
    ) -> Result<()> {
        let mut args = vec!["build".to_string(), "-t".to_string(), reference.to_string()];
        if opts.no_cache {
            args.push("--no-cache".to_string());
        }
        if opts.pull {
            args.push("--pull".to_string());
        }
        if opts.rm_tmp_container {
            args.push("--rm".to_string());
        }
        if opts.force_rm_tmp_container {
            args.push("--force-rm".to_string());
        }
        args.push("-".to_string());

        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Runtime(format!("failed to run docker build: {err}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Runtime("docker build has no stdin".to_string()))?;
        stdin
            .write_all(&archive)
            .await
            .map_err(|err| Error::Runtime(format!("failed to stream build context: {err}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| Error::Runtime(format!("docker build failed: {err}")))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "docker build failed: {}\nbuild output:\n{}",
                stderr.trim(),
                stdout.trim()
            )));
        }

        Ok(())
    }

    async fn logs(&self, id: &str, stdout: bool, stderr: bool) -> Result<(String, String)> {
        let output = Command::new("docker")
            .args(["logs", id])
            .output()
            .await
            .map_err(|err| Error::Runtime(format!("failed to run docker logs: {err}")))?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "failed to get container '{id}' logs: {}",
                err.trim()
            )));
        }

        let out = if stdout {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            String::new()
        };
        let err = if stderr {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        } else {
            String::new()
        };

        Ok((out, err))
    }

    fn subscribe(&self, handler: EventHandler) -> u64 {
        let mut counter = self.subscriber_counter.lock().unwrap();
        *counter += 1;
        let id = *counter;

        self.subscribers.lock().unwrap().insert(id, handler);
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_parsing_handles_legacy_and_modern_shapes() {
        let event = parse_event(r#"{"status":"die","id":"abc"}"#).unwrap();
        assert_eq!(event.status, "die");
        assert_eq!(event.id, "abc");

        let event =
            parse_event(r#"{"Type":"container","Action":"stop","Actor":{"ID":"def"}}"#).unwrap();
        assert_eq!(event.status, "stop");
        assert_eq!(event.id, "def");

        assert!(parse_event(r#"{"Type":"network","Action":"create"}"#).is_none());
        assert!(parse_event("not json").is_none());
    }
}
