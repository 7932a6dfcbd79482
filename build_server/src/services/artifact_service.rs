//! Build artifact packaging and removal.
//!
//! An artifact is the workspace output directory archived as
//! `<artifact_root>/<build_id>.tar.gz`, recorded with its size and sha256.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{BuildError, Result};
use crate::models::{Artifact, ArtifactKind};

use super::cache_service::sanitize;

#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    root: PathBuf,
}

impl ArtifactPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn artifact_path(&self, build_id: &str) -> PathBuf {
        self.root.join(format!("{}.tar.gz", sanitize(build_id)))
    }

    /// Archive `output_dir` for `build_id`.
    ///
    /// The archive is written to a temporary file and renamed into place, so
    /// a failed attempt never leaves a partial artifact behind.
    pub async fn package(
        &self,
        build_id: &str,
        output_dir: &Path,
        kind: ArtifactKind,
    ) -> Result<Artifact> {
        let root = self.root.clone();
        let dest = self.artifact_path(build_id);
        let source = output_dir.to_path_buf();

        let (size_bytes, digest) =
            tokio::task::spawn_blocking(move || write_archive(&source, &root, &dest))
                .await
                .map_err(|e| BuildError::Packaging(e.to_string()))??;

        crate::metrics::artifact_size(size_bytes);

        let path = self.artifact_path(build_id);
        tracing::info!(build_id, size_bytes, digest = %digest, path = %path.display(), "Artifact stored");

        Ok(Artifact {
            name: format!("{}.tar.gz", sanitize(build_id)),
            path: path.display().to_string(),
            size_bytes,
            kind,
            digest,
            created_at: Utc::now(),
        })
    }

    /// Delete the artifact file. A file that is already gone counts as removed.
    pub async fn remove(&self, artifact: &Artifact) -> std::io::Result<()> {
        match tokio::fs::remove_file(&artifact.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn write_archive(source: &Path, root: &Path, dest: &Path) -> Result<(u64, String)> {
    if !source.is_dir() {
        return Err(BuildError::Packaging(format!(
            "output directory {} does not exist",
            source.display()
        )));
    }
    std::fs::create_dir_all(root).map_err(packaging_err)?;

    let tmp = tempfile::NamedTempFile::new_in(root).map_err(packaging_err)?;
    {
        let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", source).map_err(packaging_err)?;
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(packaging_err)?;
    }

    let (size, digest) = hash_file(tmp.path())?;
    tmp.persist(dest)
        .map_err(|e| BuildError::Packaging(e.to_string()))?;
    Ok((size, digest))
}

fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = File::open(path).map_err(packaging_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(packaging_err)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, hex::encode(hasher.finalize())))
}

fn packaging_err(e: std::io::Error) -> BuildError {
    BuildError::Packaging(e.to_string())
}
