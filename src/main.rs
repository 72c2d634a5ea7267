//! turtled - daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turtled::apps::Registry;
use turtled::config::Config;
use turtled::error::Error;
use turtled::fs::Btrfs;
use turtled::hostkeys::HostKeys;
use turtled::runtime::{self, DockerCli};
use turtled::server::{self, Daemon};
use turtled::source::GitFetcher;
use turtled::state;

#[derive(Parser)]
#[command(name = "turtled")]
#[command(version)]
#[command(about = "Rock-solid single-host application cluster daemon")]
struct Args {
    /// Turtle root directory (must be on a btrfs mount).
    #[arg(long)]
    root: Option<PathBuf>,

    /// HTTP listen address.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("turtled=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::default();
    if let Some(root) = args.root {
        config.turtle_root = root;
    }
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    let config = Arc::new(config);

    info!(root = %config.turtle_root.display(), "initializing");

    // Prepare the turtle environment.
    for dir in [config.app_path(), config.backup_path(), config.turtle_path()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create '{}'", dir.display()))?;
    }

    let hostkeys = HostKeys::new(config.known_hosts_path());
    hostkeys
        .populate_known_hosts()
        .await
        .context("failed to populate known hosts")?;

    let fs = Arc::new(Btrfs);
    let fetcher = Arc::new(GitFetcher);

    // Connect the runtime, sweep leftover containers and arm the event
    // stream before any app starts.
    let docker = DockerCli::new();
    runtime::cleanup_turtle_containers(&*docker, config.stop_grace_seconds)
        .await
        .context("failed to clean up turtle containers")?;
    docker.start_event_listener();

    let registry = Registry::new(
        Arc::clone(&config),
        fs.clone(),
        docker.clone(),
        fetcher,
    );
    registry
        .load_apps()
        .await
        .context("failed to load the turtle apps")?;

    let daemon = Daemon::new(Arc::clone(&config), registry, hostkeys);

    // Background maintenance.
    spawn_balance_job(Arc::clone(&daemon), fs.clone());
    spawn_backup_retention_job(Arc::clone(&daemon));
    spawn_shutdown_handler(Arc::clone(&daemon));

    // Start all apps which were running during the last daemon shutdown.
    if let Err(err) = state::restore_state(&daemon.registry, &config).await {
        warn!(%err, "failed to restore the previous daemon state");
    }

    info!(listen = %config.listen_address, "turtle server listening");

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind '{}'", config.listen_address))?;
    axum::serve(listener, server::router(daemon)).await?;

    Ok(())
}

/// Periodic filesystem balance of the turtle root.
fn spawn_balance_job(daemon: Arc<Daemon>, fs: Arc<Btrfs>) {
    use turtled::fs::CowFs;

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(daemon.config.balance_interval / 2).await;

            let root = &daemon.config.turtle_root;
            info!(root = %root.display(), "balancing filesystem");

            match fs.balance(root, daemon.config.balance_dusage).await {
                Ok(()) => info!(root = %root.display(), "balancing done"),
                Err(err) => error!(root = %root.display(), %err, "balancing failed"),
            }

            tokio::time::sleep(daemon.config.balance_interval / 2).await;
        }
    });
}

/// Periodic removal of expired backups across all apps.
fn spawn_backup_retention_job(daemon: Arc<Daemon>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(daemon.config.remove_backup_interval / 2).await;

            {
                // Shutdown blocks the sweep by taking this lock.
                let _lock = daemon.backup_gc_lock.lock().await;
                if let Err(err) = remove_old_backups(&daemon).await {
                    error!(%err, "failed to remove some old backups");
                }
            }

            tokio::time::sleep(daemon.config.remove_backup_interval / 2).await;
        }
    });
}

/// Remove every backup older than the retention window. Errors are
/// aggregated so one bad backup does not block the rest.
async fn remove_old_backups(daemon: &Daemon) -> turtled::Result<()> {
    let expire = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|now| now.as_secs() as i64)
        .unwrap_or(0)
        - daemon.config.keep_backups_duration.as_secs() as i64;

    let mut errors = Vec::new();

    for app in daemon.registry.apps().await {
        let backups = match app.backups().await {
            Ok(backups) => backups,
            Err(err) => {
                errors.push(err.to_string());
                continue;
            }
        };

        for backup in backups {
            let timestamp: i64 = match backup.parse() {
                Ok(timestamp) => timestamp,
                Err(err) => {
                    errors.push(format!("backup '{backup}': {err}"));
                    continue;
                }
            };

            if timestamp >= expire {
                continue;
            }

            info!(app = %app.name(), backup = %backup, "removing old backup");

            if let Err(err) = app.remove_backup(&backup).await {
                errors.push(err.to_string());
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Multi(errors))
    }
}

/// Exit cleanly on SIGINT/SIGTERM: block new requests, drain the in-flight
/// ones, persist the running-apps state and lock the registry for good.
fn spawn_shutdown_handler(daemon: Arc<Daemon>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(%err, "failed to install the SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }

        info!("exiting...");

        // No new requests; in-flight ones drain first.
        let gate = daemon.request_gate.write().await;
        std::mem::forget(gate);

        // Block the retention sweep.
        let gc = daemon.backup_gc_lock.lock().await;
        std::mem::forget(gc);

        if let Err(err) = state::save_state(&daemon.registry, &daemon.config).await {
            error!(%err, "failed to save the daemon state");
        }

        daemon.registry.release().await;

        // Give the pending log writes and defers a moment.
        tokio::time::sleep(Duration::from_millis(250)).await;
        std::process::exit(0);
    });
}
