//! Starting, stopping and supervising an app's containers.
//!
//! The run task keeps the bundle alive: it starts the containers in
//! manifest order, watches the runtime event stream and restarts stopped
//! containers a bounded number of times. Stopping is cooperative: the
//! watcher's select is the only suspension point that observes it.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use super::app::App;
use super::task::TaskKind;
use crate::error::{Error, Result};
use crate::manifest::Container;
use crate::runtime::{self, CreateOptions, PortBinding};

impl App {
    /// Start the app in a new run task. A backup is taken first.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_task_running() {
            return Err(Error::Busy);
        }
        if !self.is_setup().await {
            return Err(Error::NotSetup);
        }

        self.backup().await?;

        let app = Arc::clone(self);
        self.run_task(TaskKind::Run, async move { run_app(app).await })
            .await
    }

    /// Request the running app to stop. Signals the run task; safe to call
    /// repeatedly, the stop channel is taken exactly once.
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Validation("the app is not running".to_string()));
        }

        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }

        Ok(())
    }

    /// Restart the app: flag the run loop, then stop. The loop tears the
    /// containers down and starts over.
    pub fn restart(&self) -> Result<()> {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.stop()
    }

    fn create_stop_channel(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.stop_tx.lock().unwrap() = Some(tx);
        rx
    }
}

/// Body of the run task: the supervise loop plus the periodic hot-backup
/// ticker.
async fn run_app(app: Arc<App>) -> Result<()> {
    let (ticker_stop_tx, mut ticker_stop_rx) = oneshot::channel::<()>();

    let ticker_app = Arc::clone(&app);
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ticker_app.config.backup_interval);
        interval.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    info!(app = %ticker_app.name(), "creating automatic backup");
                    if let Err(err) = ticker_app.backup().await {
                        error!(app = %ticker_app.name(), %err, "automatic backup failed");
                    }
                }
                _ = &mut ticker_stop_rx => break,
            }
        }
    });

    let result = run_loop(&app).await;

    let _ = ticker_stop_tx.send(());
    let _ = ticker.await;

    result
}

async fn run_loop(app: &Arc<App>) -> Result<()> {
    loop {
        app.restart_requested.store(false, Ordering::SeqCst);
        let mut stop_rx = app.create_stop_channel();

        // Leftovers from a previous iteration or a dirty shutdown.
        app.set_state("cleaning up containers...");
        stop_containers(app).await?;

        app.set_state("setting up app environment...");
        setup_run_environment(app).await?;

        app.set_state("starting app...");
        start_containers(app).await?;

        watch_run_state(app, &mut stop_rx).await?;

        if app.restart_requested.load(Ordering::SeqCst) {
            tokio::time::sleep(app.config.restart_cooldown).await;
            continue;
        }

        return Ok(());
    }
}

/// Ensure the volumes root and every declared per-container volume
/// directory exist with mode 0750.
async fn setup_run_environment(app: &Arc<App>) -> Result<()> {
    let volumes_root = app.volumes_dir();
    create_dir_0750(&volumes_root).await?;

    let manifest = app.manifest().await?;

    for container in &manifest.containers {
        if container.volumes.is_empty() {
            continue;
        }

        let base = volumes_root.join(&container.name);
        for volume in &container.volumes {
            let mount = Container::volume_mount_point(volume);
            create_dir_0750(&base.join(mount.trim_start_matches('/'))).await?;
        }
    }

    Ok(())
}

async fn create_dir_0750(path: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).await?;
    Ok(())
}

/// Stop and remove the app containers in reverse startup order, truncating
/// the id list as it goes.
async fn stop_containers(app: &Arc<App>) -> Result<()> {
    loop {
        let id = app.container_ids.lock().unwrap().last().cloned();
        let Some(id) = id else {
            break;
        };

        runtime::stop_and_remove(&*app.runtime, &id, app.config.stop_grace_seconds)
            .await
            .map_err(|err| {
                Error::Runtime(format!(
                    "failed to stop and remove container '{id}': {err}"
                ))
            })?;

        app.container_ids.lock().unwrap().pop();
    }

    Ok(())
}

/// Start all containers in manifest order. Already-started containers are
/// torn down again if a later one fails.
async fn start_containers(app: &Arc<App>) -> Result<()> {
    let result = start_containers_inner(app).await;

    if result.is_err() && !app.container_ids.lock().unwrap().is_empty() {
        if let Err(stop_err) = stop_containers(app).await {
            error!(app = %app.name(), %stop_err, "failed to tear down partially started app");
        }
    }

    result
}

async fn start_containers_inner(app: &Arc<App>) -> Result<()> {
    app.container_ids.lock().unwrap().clear();

    let manifest = app.manifest().await?;
    let volumes_path = app.volumes_dir();
    let source_path = app.source_dir();
    let name_prefix = app.container_name_prefix();

    // The manifest containers are already sorted into start order.
    for container in &manifest.containers {
        let container_name = format!("{name_prefix}{}", container.name);

        // A container with our name may be left over from a dirty stop.
        if let Some(existing) = app.runtime.find_by_name(&container_name).await? {
            runtime::stop_and_remove(&*app.runtime, &existing.id, app.config.stop_grace_seconds)
                .await
                .map_err(|err| {
                    Error::Runtime(format!(
                        "failed to stop and remove container '{}': {err}",
                        existing.id
                    ))
                })?;
        }

        let port_bindings: Vec<PortBinding> = {
            let settings = app.settings.lock().unwrap();
            settings
                .ports
                .iter()
                .filter(|p| p.container_name == container.name && p.host_port > 0)
                .map(|p| PortBinding {
                    container_port: p.container_port,
                    protocol: p.protocol.clone(),
                    host_port: p.host_port,
                })
                .collect()
        };

        let links: Vec<String> = container
            .links
            .iter()
            .map(|link| format!("{name_prefix}{link}:{link}"))
            .collect();

        // Static variables first, then the projected manifest environment.
        let mut env = container.env.clone();
        env.extend(app.project_env(&container.name).await?);

        let binds = container.volume_binds(&volumes_path);

        let is_local_build = container.is_local_build();
        let image_name = if is_local_build {
            container_name.clone()
        } else {
            container.image.clone()
        };
        let image = format!("{image_name}:{}", container.tag);

        if !app.runtime.image_exists(&image).await? {
            if is_local_build {
                app.set_state(&format!("building local image: {image}"));
                info!(app = %app.name(), %image, "building local image");

                runtime::build::build_local_image(
                    &*app.runtime,
                    &image_name,
                    &container.tag,
                    &container.build_path(&source_path),
                )
                .await?;
            } else {
                app.set_state(&format!("pulling image: {image}"));
                info!(app = %app.name(), %image, "pulling image");

                app.runtime
                    .pull_image(&container.image, &container.tag)
                    .await?;
            }
        }

        app.set_state(&format!("starting container: {container_name}"));
        info!(app = %app.name(), container = %container_name, "starting container");

        let opts = CreateOptions {
            name: container_name,
            image,
            hostname: container.hostname.clone(),
            domainname: container.domainname.clone(),
            env,
            cmd: container.cmd.clone(),
            entrypoint: container.entrypoint.clone(),
            working_dir: container.working_dir.clone(),
            dns: container.dns.clone(),
            network_disabled: container.network_disabled,
            network_mode: container.network_mode.clone(),
            links,
            port_bindings,
            binds,
        };

        let id = app.runtime.create(&opts).await?;
        app.runtime.start(&id).await?;

        app.container_ids.lock().unwrap().push(id);

        // Delay the next container so this one's links are up.
        let wait = if container.wait_after_startup == 0 {
            app.config.container_wait_default
        } else {
            Duration::from_millis(container.wait_after_startup as u64)
        };
        tokio::time::sleep(wait).await;
    }

    app.set_state("running");

    // Give the containers a moment before the watcher is armed.
    tokio::time::sleep(app.config.settle_after_start).await;

    Ok(())
}

/// Block until the app is stopped or restarting fails for good.
async fn watch_run_state(app: &Arc<App>, stop_rx: &mut oneshot::Receiver<()>) -> Result<()> {
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
    *app.check_restart_err_tx.lock().unwrap() = Some(err_tx);

    let event_app = Arc::clone(app);
    let subscription = app.runtime.subscribe(Box::new(move |event| {
        // Only container stop-like events are interesting.
        if !matches!(
            event.status.as_str(),
            "destroy" | "die" | "kill" | "pause" | "restart" | "stop"
        ) {
            return;
        }

        let is_ours = event_app
            .container_ids
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == &event.id);
        if is_ours {
            check_restart(&event_app);
        }
    }));

    // Initial sweep in case something died during the settle window.
    check_restart(app);

    let result = tokio::select! {
        Some(err) = err_rx.recv() => Err(err),
        _ = stop_rx => {
            // Unsubscribe first so the teardown does not trigger restarts.
            app.runtime.unsubscribe(subscription);

            app.set_state("stopping...");
            if app.restart_requested.load(Ordering::SeqCst) {
                info!(app = %app.name(), "restarting app");
            } else {
                info!(app = %app.name(), "stopping app");
            }

            stop_containers(app).await
        }
    };

    app.runtime.unsubscribe(subscription);
    *app.check_restart_err_tx.lock().unwrap() = None;

    result
}

/// Check all app containers and restart them if some stopped. Collapses
/// concurrent triggers into a single in-flight run; a failure is funneled
/// to the watcher through the error channel.
pub(crate) fn check_restart(app: &Arc<App>) {
    {
        let mut running = app.check_restart_running.lock().unwrap();
        if *running {
            return;
        }
        *running = true;
    }

    let app = Arc::clone(app);
    tokio::spawn(async move {
        let result = check_restart_inner(&app).await;

        *app.check_restart_running.lock().unwrap() = false;

        if let Err(err) = result {
            let tx = app.check_restart_err_tx.lock().unwrap().clone();
            if let Some(tx) = tx {
                let _ = tx.try_send(err);
            }
        }
    });
}

async fn check_restart_inner(app: &Arc<App>) -> Result<()> {
    let mut retry_count = 0u32;

    loop {
        retry_count += 1;

        // Collect the containers that stopped running.
        let ids = app.container_ids.lock().unwrap().clone();
        let mut stopped = Vec::new();
        for id in &ids {
            let details = app.runtime.inspect(id).await?;
            if !details.running {
                warn!(
                    app = %app.name(),
                    container_id = %details.id,
                    container = %details.name,
                    "app container stopped running"
                );
                stopped.push(details);
            }
        }

        if stopped.is_empty() {
            return Ok(());
        }

        if retry_count > app.config.max_restart_retries {
            let mut details = String::new();

            for container in &stopped {
                match app.runtime.logs(&container.id, false, true).await {
                    Ok((_, stderr)) => {
                        details.push_str(&format!(
                            "\n\nContainer '{}' error output:\n{}",
                            container.name,
                            indent_lines(&stderr)
                        ));
                    }
                    Err(err) => {
                        error!(app = %app.name(), %err, "failed to collect container logs");
                    }
                }
            }

            return Err(Error::RestartExhausted {
                app: app.name().to_string(),
                details,
            });
        }

        app.set_state("restarting app...");
        info!(app = %app.name(), retry = retry_count, "restarting app");

        stop_containers(app).await?;
        start_containers(app).await?;
    }
}

/// Prefix every line with three spaces.
fn indent_lines(text: &str) -> String {
    text.trim()
        .lines()
        .map(|line| format!("   {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
