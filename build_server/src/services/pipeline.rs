//! One build attempt: restore cache, generate the script, execute, package,
//! save cache. Workspaces live at `<workspace_root>/<build_id>` and are
//! removed when the attempt ends.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, Result};
use crate::models::{Artifact, BuildRequest, CacheSummary};

use super::artifact_service::ArtifactPackager;
use super::cache_service::{sanitize, CacheManager};
use super::executor::{ExecutionRequest, Executor};
use super::sandbox::{ImageCatalog, NetworkMode, ResourceLimits};
use super::script_generator::{self, StepLimits};

/// What an attempt produced, plus everything it logged.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub logs: Vec<String>,
    pub result: Result<(Artifact, CacheSummary)>,
}

pub struct BuildPipeline {
    pub executor: Executor,
    pub cache: CacheManager,
    pub packager: ArtifactPackager,
    pub images: ImageCatalog,
    pub limits: ResourceLimits,
    pub step_limits: StepLimits,
    pub workspace_root: PathBuf,
    /// Network attached when a plan needs egress.
    pub build_network: String,
    /// Directory holding the local mirrors that may be mounted.
    pub mirror_root: Option<PathBuf>,
}

impl BuildPipeline {
    pub fn workspace_for(&self, build_id: &str) -> PathBuf {
        self.workspace_root.join(sanitize(build_id))
    }

    /// Host path to mount for a local repository, `None` for remote ones.
    ///
    /// The path is canonicalized and must lie under the mirror root.
    pub async fn local_source(&self, request: &BuildRequest) -> Result<Option<PathBuf>> {
        let Some(path) = request.local_source() else {
            return Ok(None);
        };
        let Some(root) = self.mirror_root.as_deref() else {
            return Err(BuildError::Configuration(format!(
                "local repository {path} is not allowed: no mirror root configured"
            )));
        };
        let root = tokio::fs::canonicalize(root).await.map_err(|e| {
            BuildError::Configuration(format!("mirror root {}: {e}", root.display()))
        })?;
        let resolved = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| BuildError::Configuration(format!("local repository {path}: {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(BuildError::Configuration(format!(
                "local repository {path} is outside the mirror root"
            )));
        }
        Ok(Some(resolved))
    }

    pub async fn run_attempt(
        &self,
        build_id: &str,
        attempt: u32,
        request: &BuildRequest,
        cancel: &CancellationToken,
        progress: &watch::Sender<u8>,
    ) -> AttemptOutcome {
        let workspace = self.workspace_for(build_id);
        let mut logs = Vec::new();
        let result = self
            .attempt(build_id, attempt, request, &workspace, cancel, progress, &mut logs)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(build_id, workspace = %workspace.display(), "Workspace cleanup failed: {e}");
            }
        }
        AttemptOutcome { logs, result }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        build_id: &str,
        attempt: u32,
        request: &BuildRequest,
        workspace: &Path,
        cancel: &CancellationToken,
        progress: &watch::Sender<u8>,
        logs: &mut Vec<String>,
    ) -> Result<(Artifact, CacheSummary)> {
        let plan = script_generator::plan(&request.project_type, &request.build_config)?;
        let script = script_generator::render(request, &plan, self.step_limits);
        let source = self.local_source(request).await?;

        prepare_workspace(workspace).await?;

        let mut cache = self
            .cache
            .restore(&request.project_id, &plan.cache_lanes, workspace)
            .await;
        if cache.enabled {
            logs.push(format!(
                "[shipyard] cache {}: {} hit(s), {} miss(es)",
                cache.key.as_deref().unwrap_or_default(),
                cache.hits,
                cache.misses
            ));
        }

        let network = if plan.needs_network(request) {
            NetworkMode::Attached(self.build_network.clone())
        } else {
            NetworkMode::Disabled
        };

        let execution = self
            .executor
            .run(
                ExecutionRequest {
                    build_id: build_id.to_string(),
                    attempt,
                    script,
                    image: self.images.image_for(&request.project_type, &request.build_config),
                    env: execution_env(build_id, request, logs),
                    limits: self.limits,
                    network,
                    workspace: workspace.to_path_buf(),
                    source,
                },
                cancel,
                progress,
            )
            .await;

        logs.extend(execution.logs);
        if let Some(failure) = execution.failure {
            return Err(failure);
        }

        let artifact = self
            .packager
            .package(
                build_id,
                &workspace.join("output"),
                plan.artifact_kind,
            )
            .await?;
        logs.push(format!(
            "[shipyard] artifact {} ({} bytes, sha256 {})",
            artifact.name, artifact.size_bytes, artifact.digest
        ));

        self.cache
            .save(&request.project_id, &plan.cache_lanes, workspace, &mut cache)
            .await;

        Ok((artifact, cache))
    }
}

async fn prepare_workspace(workspace: &Path) -> Result<()> {
    if tokio::fs::try_exists(workspace).await? {
        tokio::fs::remove_dir_all(workspace).await?;
    }
    let cache_dir = workspace.join("cache");
    tokio::fs::create_dir_all(&cache_dir).await?;

    // The container runs without DAC_OVERRIDE, so the mounted tree must be
    // writable regardless of which uid owns it on the host.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for dir in [workspace, cache_dir.as_path()] {
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
        }
    }
    Ok(())
}

/// Environment for the execution container, in a fixed order.
fn execution_env(
    build_id: &str,
    request: &BuildRequest,
    logs: &mut Vec<String>,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("CI".to_string(), "true".to_string()),
        ("SHIPYARD_BUILD_ID".to_string(), build_id.to_string()),
        ("SHIPYARD_BRANCH".to_string(), request.branch.clone()),
        ("SHIPYARD_COMMIT".to_string(), request.commit.clone()),
    ];
    if matches!(
        request.project_type,
        crate::models::ProjectType::NodeBackend { .. }
    ) {
        env.push(("NODE_ENV".to_string(), "production".to_string()));
    }

    for var in &request.build_config.environment {
        if !var.injectable() {
            tracing::debug!(build_id, key = %var.key, "Secret variable withheld");
            continue;
        }
        if var.value.contains('\n') || var.key.contains('=') || var.key.trim().is_empty() {
            tracing::warn!(build_id, key = %var.key, "Variable cannot be passed to the container, skipped");
            logs.push(format!("[shipyard] skipped environment variable {}", var.key));
            continue;
        }
        env.push((var.key.clone(), var.value.clone()));
    }
    env
}
