//! Build requests produced by webhook or manual triggers.

use serde::{Deserialize, Serialize};

use super::project::{BuildConfig, ProjectType};

/// Ephemeral input; becomes a [`Build`](super::build::Build) once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub project_id: String,
    pub deployment_id: String,
    /// Clone URL, `file://` URL, or absolute path of a local mirror.
    pub repository: String,
    pub branch: String,
    /// Commit to build. `HEAD` (or empty) builds the branch tip.
    pub commit: String,
    pub project_type: ProjectType,
    pub build_config: BuildConfig,
    #[serde(default)]
    pub rebuild_from: Option<String>,
}

impl BuildRequest {
    /// Whether the repository is a local path that can be mounted into the sandbox.
    pub fn local_source(&self) -> Option<&str> {
        if let Some(path) = self.repository.strip_prefix("file://") {
            return Some(path);
        }
        self.repository
            .starts_with('/')
            .then_some(self.repository.as_str())
    }

    pub fn pinned_commit(&self) -> Option<&str> {
        let commit = self.commit.trim();
        (!commit.is_empty() && !commit.eq_ignore_ascii_case("HEAD")).then_some(commit)
    }

    pub fn short_commit(&self) -> &str {
        match self.pinned_commit() {
            Some(commit) => commit.get(..7).unwrap_or(commit),
            None => "head",
        }
    }
}
