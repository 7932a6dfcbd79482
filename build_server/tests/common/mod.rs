//! Shared fixtures: a scripted container runtime, a build store that journals
//! every persisted status, and a harness wiring them into a scheduler.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

use shipyard_build_server::error::Result;
use shipyard_build_server::models::project::{FrontendFramework, NodeTool};
use shipyard_build_server::models::{
    Build, BuildConfig, BuildRequest, BuildStatus, BuildStatusView, Deployment, DeploymentStatus,
    ProjectType,
};
use shipyard_build_server::services::artifact_service::ArtifactPackager;
use shipyard_build_server::services::cache_service::CacheManager;
use shipyard_build_server::services::deployment_service::StoreDeploymentNotifier;
use shipyard_build_server::services::executor::Executor;
use shipyard_build_server::services::pipeline::BuildPipeline;
use shipyard_build_server::services::sandbox::{
    ContainerRuntime, ContainerSpec, ImageCatalog, ResourceLimits, RunningContainer,
};
use shipyard_build_server::services::scheduler::{Scheduler, SchedulerConfig};
use shipyard_build_server::services::script_generator::{StepLimits, SUCCESS_SENTINEL};
use shipyard_build_server::services::tracker::BuildTracker;
use shipyard_build_server::store::{BuildStore, DeploymentStore, MemoryStore};

pub const CACHE_MARKER: &str = "cache/node_modules/.fake-cache";

// ── Scripted runtime ──

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Write output (the mounted source tree when there is one) and report success.
    Succeed,
    /// Print an error and exit with the code.
    Exit(i64),
    /// Exit 1 for the first `n` attempts of each build, then succeed.
    FailFirst(u32),
    /// Print one line and block until killed.
    Hang,
}

#[derive(Default)]
struct Ledger {
    specs: HashMap<String, ContainerSpec>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    killed: Vec<String>,
    live: HashSet<String>,
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    attempts: HashMap<String, u32>,
    cache_seen: Vec<bool>,
    stops: HashMap<String, Arc<Notify>>,
}

impl Ledger {
    fn stop(&mut self, id: &str) {
        if !self.live.remove(id) {
            return;
        }
        if let Some(build_id) = self.specs.get(id).map(build_id_of) {
            if let Some(count) = self.active.get_mut(&build_id) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

fn build_id_of(spec: &ContainerSpec) -> String {
    spec.env
        .iter()
        .find(|(k, _)| k == "SHIPYARD_BUILD_ID")
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

pub struct FakeRuntime {
    behavior: Behavior,
    step_delay: Duration,
    ledger: Arc<Mutex<Ledger>>,
}

impl FakeRuntime {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            step_delay: Duration::from_millis(5),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        })
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.ledger().created.clone()
    }

    pub fn created_for(&self, build_id: &str) -> usize {
        self.ledger()
            .created
            .iter()
            .filter(|spec| build_id_of(spec) == build_id)
            .count()
    }

    pub fn removed(&self) -> Vec<String> {
        self.ledger().removed.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.ledger().killed.clone()
    }

    pub fn live(&self) -> usize {
        self.ledger().live.len()
    }

    /// Highest number of simultaneously running containers seen for the build.
    pub fn peak_for(&self, build_id: &str) -> usize {
        self.ledger().peak.get(build_id).copied().unwrap_or(0)
    }

    /// Whether each started container found a restored dependency cache.
    pub fn cache_seen(&self) -> Vec<bool> {
        self.ledger().cache_seen.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut ledger = self.ledger();
        ledger.created.push(spec.clone());
        ledger.specs.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn start_attached(&self, id: &str) -> Result<RunningContainer> {
        let (spec, attempt, stop) = {
            let mut ledger = self.ledger();
            let spec = ledger.specs.get(id).cloned().unwrap();
            let build_id = build_id_of(&spec);

            ledger.live.insert(id.to_string());
            let active = {
                let count = ledger.active.entry(build_id.clone()).or_default();
                *count += 1;
                *count
            };
            let peak = ledger.peak.entry(build_id.clone()).or_default();
            *peak = (*peak).max(active);

            let attempt = {
                let n = ledger.attempts.entry(build_id).or_default();
                *n += 1;
                *n
            };
            ledger
                .cache_seen
                .push(spec.workspace.join(CACHE_MARKER).exists());

            let stop = Arc::new(Notify::new());
            ledger.stops.insert(id.to_string(), Arc::clone(&stop));
            (spec, attempt, stop)
        };

        let behavior = match self.behavior {
            Behavior::FailFirst(n) if attempt <= n => Behavior::Exit(1),
            Behavior::FailFirst(_) => Behavior::Succeed,
            other => other,
        };

        let (tx, rx) = mpsc::channel(64);
        let ledger = Arc::clone(&self.ledger);
        let delay = self.step_delay;
        let id = id.to_string();
        let exit: tokio::task::JoinHandle<Result<i64>> = tokio::spawn(async move {
            let _ = tx.send("==> Cloning repository".to_string()).await;
            tokio::time::sleep(delay).await;

            let code = match behavior {
                Behavior::Hang => {
                    stop.notified().await;
                    137
                }
                Behavior::Exit(code) => {
                    let _ = tx.send("==> Installing dependencies".to_string()).await;
                    tokio::time::sleep(delay).await;
                    let _ = tx.send("npm ERR! missing script: build".to_string()).await;
                    code
                }
                Behavior::Succeed | Behavior::FailFirst(_) => {
                    let _ = tx.send("==> Installing dependencies".to_string()).await;
                    write_output(&spec);
                    tokio::time::sleep(delay).await;
                    let _ = tx.send("==> Building".to_string()).await;
                    let _ = tx.send("Build completed".to_string()).await;
                    let _ = tx.send(SUCCESS_SENTINEL.to_string()).await;
                    0
                }
            };
            drop(tx);
            ledger.lock().unwrap().stop(&id);
            Ok(code)
        });

        Ok(RunningContainer { output: rx, exit })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let mut ledger = self.ledger();
        ledger.killed.push(id.to_string());
        if let Some(stop) = ledger.stops.get(id) {
            stop.notify_one();
        }
        ledger.stop(id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut ledger = self.ledger();
        ledger.removed.push(id.to_string());
        ledger.stop(id);
        Ok(())
    }
}

/// What the generated script would leave behind on success.
fn write_output(spec: &ContainerSpec) {
    let output = spec.workspace.join("output");
    std::fs::create_dir_all(&output).unwrap();
    match &spec.source {
        Some(source) => copy_tree(source, &output),
        None => std::fs::write(output.join("index.html"), "<h1>built</h1>").unwrap(),
    }
    let marker = spec.workspace.join(CACHE_MARKER);
    std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
    std::fs::write(marker, "cached").unwrap();
}

pub fn copy_tree(from: &Path, to: &Path) {
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

// ── Journaling store ──

/// Delegates to a [`MemoryStore`], remembering every status it persisted.
pub struct StatusJournal {
    inner: Arc<MemoryStore>,
    seen: Mutex<HashMap<String, Vec<BuildStatus>>>,
}

impl StatusJournal {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn history(&self, build_id: &str) -> Vec<BuildStatus> {
        self.seen
            .lock()
            .unwrap()
            .get(build_id)
            .cloned()
            .unwrap_or_default()
    }

    fn note(&self, build: &Build) {
        self.seen
            .lock()
            .unwrap()
            .entry(build.build_id.clone())
            .or_default()
            .push(build.status);
    }
}

#[async_trait]
impl BuildStore for StatusJournal {
    async fn insert(&self, build: &Build) -> Result<()> {
        self.inner.insert(build).await?;
        self.note(build);
        Ok(())
    }

    async fn get(&self, build_id: &str) -> Result<Option<Build>> {
        BuildStore::get(self.inner.as_ref(), build_id).await
    }

    async fn save(&self, build: &Build) -> Result<()> {
        self.inner.save(build).await?;
        self.note(build);
        Ok(())
    }

    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Build>> {
        self.inner.list_for_project(project_id, limit).await
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Build>> {
        self.inner.list_expired(cutoff).await
    }

    async fn delete(&self, build_id: &str) -> Result<bool> {
        BuildStore::delete(self.inner.as_ref(), build_id).await
    }
}

// ── Harness ──

pub struct Settings {
    pub max_retries: u32,
    pub concurrency: usize,
    pub run_timeout: Duration,
    /// Cache root override; defaults to a fresh directory.
    pub cache_root: Option<PathBuf>,
    pub claim_lease: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            concurrency: 3,
            run_timeout: Duration::from_secs(10),
            cache_root: None,
            claim_lease: Duration::from_secs(5),
        }
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub journal: Arc<StatusJournal>,
    pub runtime: Arc<FakeRuntime>,
    pub scheduler: Scheduler,
    pub artifact_root: PathBuf,
    root: tempfile::TempDir,
}

impl Harness {
    /// Wire a scheduler around `runtime`. Workers are not started.
    pub fn new(runtime: Arc<FakeRuntime>, settings: Settings) -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let journal = Arc::new(StatusJournal::new(Arc::clone(&store)));
        let artifact_root = root.path().join("artifacts");
        let scheduler = wire(root.path(), &store, &journal, &runtime, settings);

        Self {
            store,
            journal,
            runtime,
            scheduler,
            artifact_root,
            root,
        }
    }

    /// A second scheduler over the same store and runtime, standing in for
    /// another engine process. Workers are not started.
    pub fn peer(&self, settings: Settings) -> Scheduler {
        wire(self.root.path(), &self.store, &self.journal, &self.runtime, settings)
    }

    pub fn started(runtime: Arc<FakeRuntime>, settings: Settings) -> Self {
        let harness = Self::new(runtime, settings);
        harness.scheduler.start();
        harness
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub async fn wait_terminal(&self, build_id: &str) -> BuildStatusView {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        loop {
            let view = self
                .scheduler
                .get_build_status(build_id)
                .await
                .unwrap()
                .unwrap();
            if view.status.is_terminal() {
                return view;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "build {build_id} still {} after 15s",
                view.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Deployment notification is asynchronous; wait for it to land.
    pub async fn wait_deployment(&self, deployment_id: &str, status: DeploymentStatus) -> Deployment {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = DeploymentStore::get(self.store.as_ref(), deployment_id)
                .await
                .unwrap();
            if let Some(deployment) = current.filter(|d| d.status == status) {
                return deployment;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment {deployment_id} never reached {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn build(&self, build_id: &str) -> Build {
        BuildStore::get(self.store.as_ref(), build_id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn wire(
    root: &Path,
    store: &Arc<MemoryStore>,
    journal: &Arc<StatusJournal>,
    runtime: &Arc<FakeRuntime>,
    settings: Settings,
) -> Scheduler {
    let cache_root = settings
        .cache_root
        .unwrap_or_else(|| root.join("cache"));
    let tracker = BuildTracker::new(
        journal.clone(),
        Arc::new(StoreDeploymentNotifier::new(store.clone())),
    );
    let executor = Executor::new(
        runtime.clone(),
        settings.run_timeout,
        StepLimits::default(),
        1_000,
    );
    let pipeline = BuildPipeline {
        executor,
        cache: CacheManager::new(cache_root),
        packager: ArtifactPackager::new(root.join("artifacts")),
        images: ImageCatalog::default(),
        limits: ResourceLimits::default(),
        step_limits: StepLimits::default(),
        workspace_root: root.join("workspaces"),
        build_network: "bridge".into(),
        mirror_root: Some(root.to_path_buf()),
    };
    Scheduler::new(
        journal.clone(),
        store.clone(),
        tracker,
        pipeline,
        SchedulerConfig {
            concurrency: settings.concurrency,
            max_retries: settings.max_retries,
            retry_base: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            claim_lease: settings.claim_lease,
            step_limits: StepLimits::default(),
        },
    )
}

// ── Requests ──

pub fn static_request(project_id: &str, source: &Path) -> BuildRequest {
    BuildRequest {
        project_id: project_id.into(),
        deployment_id: format!("dep-{project_id}"),
        repository: source.display().to_string(),
        branch: "main".into(),
        commit: "HEAD".into(),
        project_type: ProjectType::Static,
        build_config: BuildConfig::default(),
        rebuild_from: None,
    }
}

pub fn react_request(project_id: &str) -> BuildRequest {
    BuildRequest {
        project_id: project_id.into(),
        deployment_id: format!("dep-{project_id}"),
        repository: "https://git.example.com/acme/web.git".into(),
        branch: "main".into(),
        commit: "HEAD".into(),
        project_type: ProjectType::NodeFrontend {
            framework: FrontendFramework::React,
            tool: NodeTool::Npm,
        },
        build_config: BuildConfig::default(),
        rebuild_from: None,
    }
}
