//! Dependency caches, one archive per project and lane.
//!
//! Before a run the archive for each lane is unpacked into the workspace's
//! cache directory; the script moves it into place. After a successful run the
//! directory is re-archived. Both directions are best-effort: every failure is
//! logged and counted as a miss, never surfaced to the build.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BuildError, Result};
use crate::models::project::ProjectType;
use crate::models::CacheSummary;

/// Ecosystem-specific dependency cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLane {
    NodeModules,
    PipPackages,
}

impl CacheLane {
    pub fn for_project(project_type: &ProjectType) -> Vec<Self> {
        match project_type {
            ProjectType::NodeFrontend { .. } | ProjectType::NodeBackend { .. } => {
                vec![Self::NodeModules]
            }
            ProjectType::Python { .. } => vec![Self::PipPackages],
            ProjectType::Static | ProjectType::Unrecognized { .. } => Vec::new(),
        }
    }

    /// Directory under the workspace cache mount.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::NodeModules => "node_modules",
            Self::PipPackages => "pip",
        }
    }

    pub fn ecosystem(self) -> &'static str {
        match self {
            Self::NodeModules => "node",
            Self::PipPackages => "python",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn archive_path(&self, project_id: &str, lane: CacheLane) -> PathBuf {
        self.root
            .join(project_dir(project_id))
            .join(format!("{}.tar.gz", lane.dir_name()))
    }

    /// Unpack every available lane into `<workspace>/cache/<lane>`.
    pub async fn restore(
        &self,
        project_id: &str,
        lanes: &[CacheLane],
        workspace: &Path,
    ) -> CacheSummary {
        let mut summary = CacheSummary {
            enabled: !lanes.is_empty(),
            key: cache_key(project_id, lanes),
            ..Default::default()
        };

        for &lane in lanes {
            let archive = self.archive_path(project_id, lane);
            let target = workspace.join("cache").join(lane.dir_name());

            let result = tokio::task::spawn_blocking(move || unpack(&archive, &target))
                .await
                .map_err(|e| BuildError::Cache(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(Some(bytes)) => {
                    summary.hits += 1;
                    summary.size_bytes += bytes;
                    crate::metrics::cache_lookup(lane.dir_name(), "hit");
                    tracing::info!(project_id, lane = lane.dir_name(), bytes, "Cache restored");
                }
                Ok(None) => {
                    summary.misses += 1;
                    crate::metrics::cache_lookup(lane.dir_name(), "miss");
                }
                Err(e) => {
                    summary.misses += 1;
                    crate::metrics::cache_lookup(lane.dir_name(), "error");
                    tracing::warn!(project_id, lane = lane.dir_name(), "Cache restore failed: {e}");
                }
            }
        }

        summary
    }

    /// Archive each lane's directory left in the workspace after a successful run.
    pub async fn save(
        &self,
        project_id: &str,
        lanes: &[CacheLane],
        workspace: &Path,
        summary: &mut CacheSummary,
    ) {
        let mut saved_bytes = 0;
        let mut saved_any = false;

        for &lane in lanes {
            let archive = self.archive_path(project_id, lane);
            let source = workspace.join("cache").join(lane.dir_name());

            let result = tokio::task::spawn_blocking(move || pack(&source, &archive))
                .await
                .map_err(|e| BuildError::Cache(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(Some(bytes)) => {
                    saved_any = true;
                    saved_bytes += bytes;
                    tracing::info!(project_id, lane = lane.dir_name(), bytes, "Cache saved");
                }
                Ok(None) => {
                    tracing::debug!(project_id, lane = lane.dir_name(), "Nothing to cache");
                }
                Err(e) => {
                    tracing::warn!(project_id, lane = lane.dir_name(), "Cache save failed: {e}");
                }
            }
        }

        if saved_any {
            summary.size_bytes = saved_bytes;
        }
    }
}

fn cache_key(project_id: &str, lanes: &[CacheLane]) -> Option<String> {
    if lanes.is_empty() {
        return None;
    }
    let ecosystems: Vec<&str> = lanes.iter().map(|lane| lane.ecosystem()).collect();
    Some(format!("{project_id}:{}", ecosystems.join(",")))
}

/// Returns the archive size on a hit, `None` when nothing is cached.
fn unpack(archive: &Path, target: &Path) -> Result<Option<u64>> {
    let file = match File::open(archive) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BuildError::Cache(format!("{}: {e}", archive.display()))),
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);

    if target.exists() {
        std::fs::remove_dir_all(target).map_err(cache_err)?;
    }
    std::fs::create_dir_all(target).map_err(cache_err)?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(target).map_err(cache_err)?;
    Ok(Some(size))
}

/// Returns the written archive size, `None` when `source` does not exist.
fn pack(source: &Path, archive: &Path) -> Result<Option<u64>> {
    if !source.is_dir() {
        return Ok(None);
    }
    let dir = archive
        .parent()
        .ok_or_else(|| BuildError::Cache(format!("{} has no parent", archive.display())))?;
    std::fs::create_dir_all(dir).map_err(cache_err)?;

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(cache_err)?;
    {
        let encoder = GzEncoder::new(tmp.as_file(), Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", source).map_err(cache_err)?;
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(cache_err)?;
    }
    let size = tmp.as_file().metadata().map(|m| m.len()).unwrap_or(0);
    tmp.persist(archive)
        .map_err(|e| BuildError::Cache(e.to_string()))?;
    Ok(Some(size))
}

fn cache_err(e: std::io::Error) -> BuildError {
    BuildError::Cache(e.to_string())
}

/// Cache directory of a project: the hex sha256 of its id, so distinct ids
/// never share a directory.
fn project_dir(project_id: &str) -> String {
    hex::encode(Sha256::digest(project_id.as_bytes()))
}

/// Keep identifiers usable as a single path component.
pub(crate) fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
