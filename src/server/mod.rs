//! The request dispatcher: a single JSON endpoint multiplexing every
//! daemon operation, guarded by a readers-writer gate that shutdown takes
//! in writer mode to drain in-flight requests.

pub mod api;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::DateTime;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::apps::Registry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hostkeys::HostKeys;

/// Shared daemon state handed to every request handler.
pub struct Daemon {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub hostkeys: HostKeys,

    /// Held in read mode for the duration of each request; shutdown takes
    /// it in write mode to block new requests.
    pub request_gate: RwLock<()>,
    /// Held by the retention sweep; shutdown locks it to block the sweep.
    pub backup_gc_lock: Mutex<()>,
}

impl Daemon {
    pub fn new(config: Arc<Config>, registry: Registry, hostkeys: HostKeys) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            hostkeys,
            request_gate: RwLock::new(()),
            backup_gc_lock: Mutex::new(()),
        })
    }
}

/// Build the HTTP router with the single request endpoint.
pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new().route("/", post(handle)).with_state(daemon)
}

async fn handle(State(daemon): State<Arc<Daemon>>, body: Bytes) -> Json<api::Response> {
    let _gate = daemon.request_gate.read().await;

    let request: api::Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "malformed request");
            return Json(api::Response::error(format!("failed to decode JSON: {err}")));
        }
    };

    if request.version != api::VERSION {
        let message = format!(
            "API versions don't match: client={} server={}",
            request.version,
            api::VERSION
        );
        warn!("{message}");
        return Json(api::Response::error(message));
    }

    info!(request = %request.request_type, "handling request");

    let request_type = request.request_type.clone();

    // Run the handler on its own task so a panic is recovered into an
    // error response instead of tearing the connection down.
    let outcome = tokio::spawn(dispatch(Arc::clone(&daemon), request)).await;

    match outcome {
        Ok(Ok(data)) => Json(api::Response::success(data)),
        Ok(Err(err)) => {
            warn!(request = %request_type, %err, "request failed");
            Json(api::Response::error(err.to_string()))
        }
        Err(join_err) => {
            warn!(request = %request_type, "request handler panicked: {join_err}");
            Json(api::Response::error(format!("panic: {join_err}")))
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|err| Error::Validation(format!("failed to decode request data: {err}")))
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("missing or invalid data: {what}")));
    }
    Ok(())
}

async fn dispatch(daemon: Arc<Daemon>, request: api::Request) -> Result<Value> {
    match request.request_type.as_str() {
        "add" => handle_add(&daemon, request.data).await,
        "remove" => handle_remove(&daemon, request.data).await,
        "info" => handle_info(&daemon, request.data).await,
        "list" => handle_list(&daemon).await,
        "start" => handle_start(&daemon, request.data).await,
        "stop" => handle_stop(&daemon, request.data).await,
        "restart" => handle_restart(&daemon, request.data).await,
        "setup-get" => handle_setup_get(&daemon, request.data).await,
        "setup-set" => handle_setup_set(&daemon, request.data).await,
        "error-msg" => handle_error_msg(&daemon, request.data).await,
        "update" => handle_update(&daemon, request.data).await,
        "backup" => handle_backup(&daemon, request.data).await,
        "list-backups" => handle_list_backups(&daemon, request.data).await,
        "remove-backup" => handle_remove_backup(&daemon, request.data).await,
        "restore-backup" => handle_restore_backup(&daemon, request.data).await,
        "add-host-fingerprint" => handle_add_host_fingerprint(&daemon, request.data).await,
        "host-fingerprint-info" => handle_host_fingerprint_info(&daemon, request.data).await,
        unknown => Err(Error::Validation(format!(
            "unknown request type '{unknown}'"
        ))),
    }
}

async fn handle_add(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestAdd = decode(data)?;
    require(&data.name, "Name")?;
    require(&data.source_url, "SourceURL")?;
    require(&data.branch, "Branch")?;

    daemon
        .registry
        .add(&data.name, &data.source_url, &data.branch)
        .await?;
    Ok(Value::Null)
}

async fn handle_remove(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestRemove = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.remove(&data.name, data.remove_backups).await?;
    Ok(Value::Null)
}

async fn handle_info(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    let app = daemon.registry.get(&data.name).await?;
    let setup = app.get_setup().await?;
    let manifest = app.manifest().await?;

    let info = api::ResponseInfo {
        name: app.name().to_string(),
        turtlefile: manifest.name.clone(),
        maintainer: manifest.maintainer.clone(),
        state: app.state(),
        source_url: app.source_url(),
        branch: app.branch(),
        setup,
    };

    Ok(serde_json::to_value(info)?)
}

async fn handle_list(daemon: &Daemon) -> Result<Value> {
    let mut apps = Vec::new();

    for app in daemon.registry.apps().await {
        let turtlefile = match app.manifest().await {
            Ok(manifest) => manifest.name.clone(),
            Err(_) => "error in manifest file".to_string(),
        };

        apps.push(api::ResponseListApp {
            name: app.name().to_string(),
            turtlefile,
            state: app.state(),
        });
    }

    Ok(serde_json::to_value(api::ResponseList { apps })?)
}

async fn handle_start(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.get(&data.name).await?.start().await?;
    Ok(Value::Null)
}

async fn handle_stop(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.get(&data.name).await?.stop()?;
    Ok(Value::Null)
}

async fn handle_restart(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.get(&data.name).await?.restart()?;
    Ok(Value::Null)
}

async fn handle_setup_get(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    let setup = daemon.registry.get(&data.name).await?.get_setup().await?;
    Ok(serde_json::to_value(setup)?)
}

async fn handle_setup_set(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestSetupSet = decode(data)?;
    require(&data.name, "Name")?;

    daemon
        .registry
        .get(&data.name)
        .await?
        .set_setup(&data.setup)
        .await?;
    Ok(Value::Null)
}

async fn handle_error_msg(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    let app = daemon.registry.get(&data.name).await?;
    let response = api::ResponseErrorMsg {
        name: data.name,
        error_message: app
            .last_error()
            .map(|message| message.trim().to_string())
            .unwrap_or_default(),
    };

    Ok(serde_json::to_value(response)?)
}

async fn handle_update(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.get(&data.name).await?.update().await?;
    Ok(Value::Null)
}

async fn handle_backup(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    daemon.registry.get(&data.name).await?.backup().await?;
    Ok(Value::Null)
}

async fn handle_list_backups(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestApp = decode(data)?;
    require(&data.name, "Name")?;

    let app = daemon.registry.get(&data.name).await?;

    let mut backups = Vec::new();
    for unix in app.backups().await? {
        let timestamp: i64 = unix.parse().map_err(|_| {
            Error::Validation(format!("failed to parse backup timestamp '{unix}'"))
        })?;
        let date = DateTime::from_timestamp(timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S %Z").to_string())
            .unwrap_or_default();

        backups.push(api::ResponseListBackup { date, unix });
    }

    Ok(serde_json::to_value(api::ResponseListBackups { backups })?)
}

async fn handle_remove_backup(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestBackupRef = decode(data)?;
    require(&data.name, "Name")?;
    require(&data.unix, "Unix")?;

    daemon
        .registry
        .get(&data.name)
        .await?
        .remove_backup(&data.unix)
        .await?;
    Ok(Value::Null)
}

async fn handle_restore_backup(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestBackupRef = decode(data)?;
    require(&data.name, "Name")?;
    require(&data.unix, "Unix")?;

    daemon
        .registry
        .get(&data.name)
        .await?
        .restore_backup(&data.unix)
        .await?;
    Ok(Value::Null)
}

async fn handle_add_host_fingerprint(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestAddHostFingerprint = decode(data)?;
    require(&data.fingerprint, "Fingerprint")?;

    daemon.hostkeys.add_fingerprint(&data.fingerprint).await?;
    Ok(Value::Null)
}

async fn handle_host_fingerprint_info(daemon: &Daemon, data: Value) -> Result<Value> {
    let data: api::RequestHostFingerprintInfo = decode(data)?;
    require(&data.host, "Host")?;

    let trusted = daemon.hostkeys.fingerprint_exists(&data.host).await?;
    let fingerprint = daemon.hostkeys.scan_fingerprint(&data.host).await?;

    let response = api::ResponseHostFingerprintInfo {
        host: data.host,
        trusted,
        fingerprint,
    };

    Ok(serde_json::to_value(response)?)
}
