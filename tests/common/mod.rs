//! Test helpers: in-memory fakes for the capability seams and a harness
//! wiring them into a registry over a scratch directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use turtled::apps::{App, Registry};
use turtled::config::Config;
use turtled::error::{Error, Result};
use turtled::fs::CowFs;
use turtled::runtime::{
    BuildOptions, ContainerDetails, ContainerSummary, CreateOptions, EventHandler, Runtime,
    RuntimeEvent,
};
use turtled::source::SourceFetcher;

/// A manifest with two linked containers and no required setup.
pub const TWO_CONTAINER_MANIFEST: &str = r#"
Name = "blog"
Maintainer = "ops@example.org"

[[Container]]
Name = "web"
Image = "app"
Links = ["db"]

[[Container]]
Name = "db"
Image = "postgres"

[[Port]]
Container = "web"
Port = 80
"#;

//
// Fake container runtime.
//

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
}

#[derive(Default)]
struct RuntimeInner {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    next_id: u64,
    /// Container names that stop again right after being started.
    auto_exit: HashSet<String>,
    /// stderr log text by container name.
    stderr: HashMap<String, String>,
    /// Creation order, by container name.
    created: Vec<String>,
    /// Removal order, by container name.
    removed: Vec<String>,
}

pub struct FakeRuntime {
    inner: Mutex<RuntimeInner>,
    subscribers: Mutex<HashMap<u64, EventHandler>>,
    subscriber_counter: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RuntimeInner::default()),
            subscribers: Mutex::new(HashMap::new()),
            subscriber_counter: AtomicU64::new(0),
        })
    }

    /// Make a container (by runtime name) exit immediately after start.
    pub fn set_auto_exit(&self, name: &str) {
        self.inner.lock().unwrap().auto_exit.insert(name.to_string());
    }

    pub fn clear_auto_exit(&self, name: &str) {
        self.inner.lock().unwrap().auto_exit.remove(name);
    }

    /// Script the stderr log of a container (by runtime name).
    pub fn set_stderr(&self, name: &str, log: &str) {
        self.inner
            .lock()
            .unwrap()
            .stderr
            .insert(name.to_string(), log.to_string());
    }

    /// Mark a container as no longer running, as if it crashed.
    pub fn kill_container(&self, id: &str) {
        if let Some(container) = self.inner.lock().unwrap().containers.get_mut(id) {
            container.running = false;
        }
    }

    /// Names of all live containers.
    pub fn running_container_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    /// Container names in creation order, over the whole test run.
    pub fn created_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().created.clone()
    }

    /// Container names in removal order, over the whole test run.
    pub fn removed_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    /// All image references known to the runtime.
    pub fn image_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().images.iter().cloned().collect()
    }

    pub fn name_of(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.name.clone())
    }

    /// Fan an event out to the subscribers, like the real event stream.
    pub fn emit(&self, status: &str, id: &str) {
        let event = RuntimeEvent {
            status: status.to_string(),
            id: id.to_string(),
        };
        let subscribers = self.subscribers.lock().unwrap();
        for handler in subscribers.values() {
            handler(&event);
        }
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get(id)
            .ok_or_else(|| Error::Runtime(format!("container not found: {id}")))?;
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            paused: false,
            restarting: false,
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerDetails>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| ContainerDetails {
                id: c.id.clone(),
                name: c.name.clone(),
                running: c.running,
                paused: false,
                restarting: false,
            }))
    }

    async fn create(&self, opts: &CreateOptions) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("cid-{}", inner.next_id);

        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: opts.name.clone(),
                running: false,
            },
        );
        let name = opts.name.clone();
        inner.created.push(name);

        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let auto_exit = inner.auto_exit.clone();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::Runtime(format!("container not found: {id}")))?;
        container.running = !auto_exit.contains(&container.name);
        Ok(())
    }

    async fn stop(&self, id: &str, _grace_seconds: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.remove(id) {
            inner.removed.push(container.name);
        }
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().images.contains(reference))
    }

    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(format!("{repository}:{tag}"));
        Ok(())
    }

    async fn tag_image(&self, _source: &str, repository: &str, tag: &str, _force: bool) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(format!("{repository}:{tag}"));
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.inner.lock().unwrap().images.remove(reference);
        Ok(())
    }

    async fn build_image(&self, _archive: Vec<u8>, tag: &str, _opts: &BuildOptions) -> Result<()> {
        self.inner.lock().unwrap().images.insert(tag.to_string());
        Ok(())
    }

    async fn logs(&self, id: &str, _stdout: bool, stderr: bool) -> Result<(String, String)> {
        let inner = self.inner.lock().unwrap();
        let name = inner
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let err = if stderr {
            inner.stderr.get(&name).cloned().unwrap_or_default()
        } else {
            String::new()
        };
        Ok((String::new(), err))
    }

    fn subscribe(&self, handler: EventHandler) -> u64 {
        let id = self.subscriber_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.lock().unwrap().insert(id, handler);
        id
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }
}

//
// Fake copy-on-write filesystem: snapshots are directory copies, the
// readonly flag is tracked in a set.
//

pub struct FakeCowFs {
    pub readonly: Mutex<HashSet<PathBuf>>,
    fail_next_snapshot: AtomicBool,
}

impl FakeCowFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            readonly: Mutex::new(HashSet::new()),
            fail_next_snapshot: AtomicBool::new(false),
        })
    }

    /// Make the next snapshot call fail without creating anything.
    pub fn fail_next_snapshot(&self) {
        self.fail_next_snapshot.store(true, Ordering::SeqCst);
    }

    pub fn is_readonly(&self, path: &Path) -> bool {
        self.readonly.lock().unwrap().contains(path)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl CowFs for FakeCowFs {
    async fn is_subvolume(&self, path: &Path) -> bool {
        path.is_dir()
    }

    async fn create_subvolume(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path)?;
        self.readonly.lock().unwrap().remove(path);
        Ok(())
    }

    async fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        let mut set = self.readonly.lock().unwrap();
        if readonly {
            set.insert(path.to_path_buf());
        } else {
            set.remove(path);
        }
        Ok(())
    }

    async fn snapshot(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        if !self.is_subvolume(src).await {
            return Err(Error::Fs(format!(
                "'{}' is not a subvolume",
                src.display()
            )));
        }
        if dst.exists() {
            return Err(Error::Fs(format!("'{}' already exists", dst.display())));
        }
        if self.fail_next_snapshot.swap(false, Ordering::SeqCst) {
            return Err(Error::Fs("injected snapshot failure".to_string()));
        }

        copy_dir(src, dst)?;
        if readonly {
            self.readonly.lock().unwrap().insert(dst.to_path_buf());
        }
        Ok(())
    }

    async fn balance(&self, _root: &Path, _dusage: u32) -> Result<()> {
        Ok(())
    }
}

//
// Fake source fetcher: "cloning" writes a scripted source tree.
//

pub struct FakeFetcher {
    default_manifest: String,
    overrides: Mutex<HashMap<String, String>>,
}

impl FakeFetcher {
    pub fn new(manifest: &str) -> Arc<Self> {
        Arc::new(Self {
            default_manifest: manifest.to_string(),
            overrides: Mutex::new(HashMap::new()),
        })
    }

    /// Use a different manifest for one app.
    pub fn set_manifest_for(&self, app: &str, manifest: &str) {
        self.overrides
            .lock()
            .unwrap()
            .insert(app.to_string(), manifest.to_string());
    }

    fn manifest_for(&self, dest: &Path) -> String {
        // The source directory lives at <apps>/<app>/source.
        let app = dest
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.overrides
            .lock()
            .unwrap()
            .get(&app)
            .cloned()
            .unwrap_or_else(|| self.default_manifest.clone())
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn clone_into(&self, _url: &str, _branch: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("TURTLE"), self.manifest_for(dest))?;
        std::fs::create_dir_all(dest.join("web"))?;
        std::fs::write(dest.join("web/Dockerfile"), "FROM scratch\n")?;
        Ok(())
    }

    async fn pull(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join("TURTLE"), self.manifest_for(dir))?;
        Ok(())
    }
}

//
// Harness.
//

pub struct TestEnv {
    pub root: TempDir,
    pub config: Arc<Config>,
    pub fs: Arc<FakeCowFs>,
    pub runtime: Arc<FakeRuntime>,
    pub fetcher: Arc<FakeFetcher>,
    pub registry: Registry,
}

impl TestEnv {
    pub fn new(manifest: &str) -> TestEnv {
        let root = TempDir::new().expect("failed to create a scratch root");

        let config = Arc::new(Config {
            turtle_root: root.path().to_path_buf(),
            listen_address: "127.0.0.1:0".to_string(),
            backup_interval: Duration::from_secs(3600),
            container_wait_default: Duration::from_millis(5),
            settle_after_start: Duration::from_millis(20),
            restart_cooldown: Duration::from_millis(5),
            ..Config::default()
        });

        std::fs::create_dir_all(config.app_path()).unwrap();
        std::fs::create_dir_all(config.backup_path()).unwrap();
        std::fs::create_dir_all(config.turtle_path()).unwrap();

        let fs = FakeCowFs::new();
        let runtime = FakeRuntime::new();
        let fetcher = FakeFetcher::new(manifest);

        let registry = Registry::new(
            Arc::clone(&config),
            fs.clone(),
            runtime.clone(),
            fetcher.clone(),
        );

        TestEnv {
            root,
            config,
            fs,
            runtime,
            fetcher,
            registry,
        }
    }

    /// Add an app and wait for its clone task to finish.
    pub async fn add_app(&self, name: &str) -> Arc<App> {
        self.registry
            .add(name, "git@example.org:app.git", "master")
            .await
            .expect("failed to add app");

        let app = self.registry.get(name).await.expect("app not registered");
        wait_until(|| !app.is_task_running()).await;
        assert_eq!(app.last_error(), None, "clone task failed");

        app
    }
}

/// Poll until the condition holds, panicking after a few seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    result.expect("condition not met in time");
}
