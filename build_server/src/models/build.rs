//! Build: one attempt to turn a source commit into a deployable artifact.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::schema::builds;

use super::request::BuildRequest;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub const TERMINAL: [BuildStatus; 3] = [Self::Success, Self::Failed, Self::Cancelled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Allowed edges of the build state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// A named, time-bounded phase of a build with its own captured log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub attempt: u32,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub logs: Vec<String>,
}

impl Stage {
    pub fn start(name: impl Into<String>, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            attempt,
            status: StageStatus::Running,
            started_at: now,
            ended_at: None,
            duration_ms: None,
            logs: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: StageStatus, logs: Vec<String>, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.logs.extend(logs);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub enabled: bool,
    pub key: Option<String>,
    pub hits: u32,
    pub misses: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Static files ready to be served.
    StaticSite,
    /// Source tree plus a synthesized container manifest.
    ContainerContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub kind: ArtifactKind,
    /// Hex sha256 of the archive.
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

/// Error summary recorded on a failed build and forwarded to its deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub reason: String,
    pub message: String,
    pub exit_code: Option<i64>,
}

impl From<&BuildError> for FailureSummary {
    fn from(err: &BuildError) -> Self {
        Self {
            reason: err.reason().to_string(),
            message: err.to_string(),
            exit_code: err.exit_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    pub deployment_id: String,
    pub project_id: String,
    pub status: BuildStatus,
    pub request: BuildRequest,
    pub rebuild_from: Option<String>,
    pub stages: Vec<Stage>,
    pub cache: CacheSummary,
    pub artifacts: Vec<Artifact>,
    pub error: Option<FailureSummary>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Build {
    pub fn new(build_id: String, request: BuildRequest, max_retries: u32) -> Self {
        Self {
            build_id,
            deployment_id: request.deployment_id.clone(),
            project_id: request.project_id.clone(),
            status: BuildStatus::Pending,
            rebuild_from: request.rebuild_from.clone(),
            request,
            stages: Vec::new(),
            cache: CacheSummary::default(),
            artifacts: Vec::new(),
            error: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Move to `next`, stamping start/completion times.
    ///
    /// Terminal builds reject every transition.
    pub fn transition(&mut self, next: BuildStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BuildError::AlreadyTerminal(self.build_id.clone()));
        }
        if !self.status.can_transition_to(next) {
            return Err(BuildError::Store(format!(
                "invalid transition {} -> {} for build {}",
                self.status, next, self.build_id
            )));
        }

        self.status = next;
        if next == BuildStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            let start = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - start).num_milliseconds().max(0));
        }
        Ok(())
    }

    /// Highest attempt number that has started, 0 before the first.
    pub fn latest_attempt(&self) -> u32 {
        self.stages.iter().map(|stage| stage.attempt).max().unwrap_or(0)
    }

    pub fn current_stage_mut(&mut self) -> Option<&mut Stage> {
        self.stages
            .last_mut()
            .filter(|stage| stage.status == StageStatus::Running)
    }

    /// All stage logs, attempt by attempt, in capture order.
    pub fn render_logs(&self) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            out.push_str(&format!(
                "── {} (attempt {}, {:?}) ──\n",
                stage.name, stage.attempt, stage.status
            ));
            for line in &stage.logs {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// Non-blocking status query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatusView {
    pub build_id: String,
    pub status: BuildStatus,
    pub progress: u8,
    pub queue_position: Option<usize>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub artifacts: Vec<Artifact>,
    pub error: Option<FailureSummary>,
    pub rebuild_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildLogs {
    pub build_id: String,
    pub logs: String,
    pub exists: bool,
}

// ── Persistence rows ──

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = builds)]
#[diesel(treat_none_as_null = true)]
pub struct BuildRow {
    pub build_id: String,
    pub deployment_id: String,
    pub project_id: String,
    pub status: String,
    pub rebuild_from: Option<String>,
    pub request: serde_json::Value,
    pub stages: serde_json::Value,
    pub cache: serde_json::Value,
    pub artifacts: serde_json::Value,
    pub error: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl TryFrom<&Build> for BuildRow {
    type Error = BuildError;

    fn try_from(build: &Build) -> Result<Self> {
        Ok(Self {
            build_id: build.build_id.clone(),
            deployment_id: build.deployment_id.clone(),
            project_id: build.project_id.clone(),
            status: build.status.as_str().to_string(),
            rebuild_from: build.rebuild_from.clone(),
            request: serde_json::to_value(&build.request)?,
            stages: serde_json::to_value(&build.stages)?,
            cache: serde_json::to_value(&build.cache)?,
            artifacts: serde_json::to_value(&build.artifacts)?,
            error: build.error.as_ref().map(serde_json::to_value).transpose()?,
            retry_count: build.retry_count as i32,
            max_retries: build.max_retries as i32,
            created_at: build.created_at,
            started_at: build.started_at,
            completed_at: build.completed_at,
            duration_ms: build.duration_ms,
        })
    }
}

impl TryFrom<BuildRow> for Build {
    type Error = BuildError;

    fn try_from(row: BuildRow) -> Result<Self> {
        let status = BuildStatus::parse(&row.status)
            .ok_or_else(|| BuildError::Store(format!("unknown build status {}", row.status)))?;
        Ok(Self {
            build_id: row.build_id,
            deployment_id: row.deployment_id,
            project_id: row.project_id,
            status,
            rebuild_from: row.rebuild_from,
            request: serde_json::from_value(row.request)?,
            stages: serde_json::from_value(row.stages)?,
            cache: serde_json::from_value(row.cache)?,
            artifacts: serde_json::from_value(row.artifacts)?,
            error: row.error.map(serde_json::from_value).transpose()?,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}
