//! Execution environments.
//!
//! [`ContainerRuntime`] is the seam to the container engine; [`DockerCli`]
//! drives the `docker` binary. A [`SandboxLease`] owns one created container
//! and removes it on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BuildError, Result};
use crate::models::project::{BuildConfig, ProjectType};

use super::script_generator::{LOCAL_SOURCE_MOUNT, WORKSPACE_MOUNT};

/// Capacity of the per-container log channel.
const LOG_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub pids_limit: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_shares: 512,
            pids_limit: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Disabled,
    Attached(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted read-write at `/workspace`.
    pub workspace: PathBuf,
    /// Host repository mounted read-only at `/source`.
    pub source: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    pub command: Vec<String>,
}

/// A started container: its combined output and its eventual exit code.
pub struct RunningContainer {
    pub output: mpsc::Receiver<String>,
    pub exit: JoinHandle<Result<i64>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start the container and attach to its output.
    async fn start_attached(&self, id: &str) -> Result<RunningContainer>;

    async fn kill(&self, id: &str) -> Result<()>;

    /// Remove the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<()>;
}

// ── Image catalog ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCatalog {
    pub static_image: String,
    pub node_image: Option<String>,
    pub python_image: Option<String>,
    pub fallback_image: String,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self {
            static_image: "nginx:alpine".to_string(),
            node_image: None,
            python_image: None,
            fallback_image: "alpine:3.20".to_string(),
        }
    }
}

impl ImageCatalog {
    /// Execution image for a project type, honouring configured runtime versions.
    pub fn image_for(&self, project_type: &ProjectType, config: &BuildConfig) -> String {
        match project_type {
            ProjectType::Static => self.static_image.clone(),
            ProjectType::NodeFrontend { .. } | ProjectType::NodeBackend { .. } => self
                .node_image
                .clone()
                .unwrap_or_else(|| format!("node:{}-alpine", config.node_version())),
            ProjectType::Python { .. } => self
                .python_image
                .clone()
                .unwrap_or_else(|| format!("python:{}-slim", config.python_version())),
            ProjectType::Unrecognized { language } => match language.as_deref() {
                Some("ruby") => "ruby:3.2-slim".to_string(),
                Some("php") => "php:8.2-cli".to_string(),
                Some("java") => "eclipse-temurin:17".to_string(),
                Some("go") => "golang:1.22-alpine".to_string(),
                _ => self.fallback_image.clone(),
            },
        }
    }
}

// ── Docker CLI runtime ──

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BuildError::Runtime(format!("failed to run {}: {e}", self.binary)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(BuildError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )))
        }
    }
}

/// Arguments for `docker create`.
pub fn create_args(spec: &ContainerSpec, env_file: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        spec.name.clone(),
        "--memory".into(),
        format!("{}m", spec.limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", spec.limits.memory_mb),
        "--cpu-shares".into(),
        spec.limits.cpu_shares.to_string(),
        "--pids-limit".into(),
        spec.limits.pids_limit.to_string(),
        "--cap-drop".into(),
        "ALL".into(),
    ];
    for cap in ["CHOWN", "SETUID", "SETGID"] {
        args.push("--cap-add".into());
        args.push(cap.into());
    }
    args.push("--security-opt".into());
    args.push("no-new-privileges".into());

    args.push("--network".into());
    args.push(match &spec.network {
        NetworkMode::Disabled => "none".to_string(),
        NetworkMode::Attached(name) => name.clone(),
    });

    args.push("-v".into());
    args.push(format!("{}:{WORKSPACE_MOUNT}", spec.workspace.display()));
    if let Some(source) = &spec.source {
        args.push("-v".into());
        args.push(format!("{}:{LOCAL_SOURCE_MOUNT}:ro", source.display()));
    }
    if let Some(path) = env_file {
        args.push("--env-file".into());
        args.push(path.display().to_string());
    }
    args.push("--workdir".into());
    args.push(WORKSPACE_MOUNT.into());
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        // The CLI reads the env-file at create time; it is deleted afterwards.
        let env_file = if spec.env.is_empty() {
            None
        } else {
            let mut contents = String::new();
            for (key, value) in &spec.env {
                contents.push_str(key);
                contents.push('=');
                contents.push_str(value);
                contents.push('\n');
            }
            let file = tempfile::NamedTempFile::new()?;
            tokio::fs::write(file.path(), contents).await?;
            Some(file)
        };

        let args = create_args(spec, env_file.as_ref().map(|f| f.path()));
        let id = self.exec(&args).await?;
        tracing::debug!(container = %spec.name, id = %id, image = %spec.image, "Container created");
        Ok(id)
    }

    async fn start_attached(&self, id: &str) -> Result<RunningContainer> {
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::Runtime(format!("failed to start container: {e}")))?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, tx.clone())));
        let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, tx)));

        let exit = tokio::spawn(async move {
            let status = child
                .wait()
                .await
                .map_err(|e| BuildError::Runtime(format!("waiting on container: {e}")))?;
            for pump in [stdout, stderr].into_iter().flatten() {
                let _ = pump.await;
            }
            // Killed by signal: report the conventional 128 + n.
            Ok(status.code().map(i64::from).unwrap_or(137))
        });

        Ok(RunningContainer { output: rx, exit })
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.exec(&["kill".to_string(), id.to_string()]).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.exec(&["rm".to_string(), "-f".to_string(), "-v".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }
}

/// Forward lines from a child stream, lossily decoded.
async fn pump<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ── Scoped lease ──

/// Owns one created container until [`SandboxLease::release`].
///
/// Dropping an unreleased lease schedules removal on the current runtime.
pub struct SandboxLease {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    name: String,
    released: bool,
}

impl SandboxLease {
    pub async fn acquire(runtime: Arc<dyn ContainerRuntime>, spec: &ContainerSpec) -> Result<Self> {
        let id = runtime.create(spec).await?;
        Ok(Self {
            runtime,
            id,
            name: spec.name.clone(),
            released: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn start(&self) -> Result<RunningContainer> {
        self.runtime.start_attached(&self.id).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.runtime.kill(&self.id).await
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.runtime.remove(&self.id).await;
        match &result {
            Ok(()) => tracing::debug!(container = %self.name, "Container removed"),
            Err(e) => tracing::warn!(container = %self.name, "Container removal failed: {e}"),
        }
        result
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(container = %self.name, "Lease dropped without release, removing container");
        let runtime = Arc::clone(&self.runtime);
        let id = std::mem::take(&mut self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runtime.remove(&id).await {
                    tracing::warn!(container = %id, "Deferred container removal failed: {e}");
                }
            });
        }
    }
}
