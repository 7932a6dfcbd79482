//! Build event definitions and how they fold into a build document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::models::{Artifact, Build, BuildStatus, CacheSummary, FailureSummary, Stage, StageStatus};

/// Events that can happen to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// A worker claimed the job and started an attempt.
    AttemptStarted { attempt: u32 },
    /// An attempt failed and another one is scheduled.
    AttemptFailed {
        attempt: u32,
        error: FailureSummary,
        logs: Vec<String>,
    },
    /// Build finished successfully and produced an artifact.
    BuildSucceeded {
        artifact: Artifact,
        cache: CacheSummary,
        logs: Vec<String>,
    },
    /// Build failed permanently.
    BuildFailed {
        error: FailureSummary,
        logs: Vec<String>,
    },
    /// Build was cancelled while pending or running.
    BuildCancelled { logs: Vec<String> },
}

impl BuildEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttemptStarted { .. } => "attempt_started",
            Self::AttemptFailed { .. } => "attempt_failed",
            Self::BuildSucceeded { .. } => "build_succeeded",
            Self::BuildFailed { .. } => "build_failed",
            Self::BuildCancelled { .. } => "build_cancelled",
        }
    }

    /// Fold this event into `build`.
    ///
    /// Fails without touching the document when the build is already terminal
    /// or the event is not valid in its current state.
    pub fn apply(self, build: &mut Build, now: DateTime<Utc>) -> Result<()> {
        if build.status.is_terminal() {
            return Err(BuildError::AlreadyTerminal(build.build_id.clone()));
        }

        match self {
            Self::AttemptStarted { attempt } => {
                if build.latest_attempt() >= attempt {
                    return Err(stale(build, attempt));
                }
                if build.status == BuildStatus::Pending {
                    build.transition(BuildStatus::Running, now)?;
                }
                // An attempt whose worker died never reported back.
                if let Some(stage) = build.current_stage_mut() {
                    let line = format!("[shipyard] attempt {} interrupted", stage.attempt);
                    stage.finish(StageStatus::Failed, vec![line], now);
                }
                build.stages.push(Stage::start("build", attempt, now));
            }
            Self::AttemptFailed {
                attempt,
                error,
                logs,
            } => {
                if build.status != BuildStatus::Running {
                    return Err(BuildError::Store(format!(
                        "attempt failure reported for {} build {}",
                        build.status, build.build_id
                    )));
                }
                if build.latest_attempt() > attempt {
                    return Err(stale(build, attempt));
                }
                close_stage(build, StageStatus::Failed, logs, now);
                build.retry_count += 1;
                build.error = Some(error);
            }
            Self::BuildSucceeded {
                artifact,
                cache,
                logs,
            } => {
                build.transition(BuildStatus::Success, now)?;
                close_stage(build, StageStatus::Success, logs, now);
                build.artifacts.push(artifact);
                build.cache = cache;
                build.error = None;
            }
            Self::BuildFailed { error, logs } => {
                build.transition(BuildStatus::Failed, now)?;
                close_stage(build, StageStatus::Failed, logs, now);
                build.error = Some(error);
            }
            Self::BuildCancelled { logs } => {
                build.transition(BuildStatus::Cancelled, now)?;
                close_stage(build, StageStatus::Skipped, logs, now);
            }
        }
        Ok(())
    }
}

fn stale(build: &Build, attempt: u32) -> BuildError {
    BuildError::StaleAttempt {
        build_id: build.build_id.clone(),
        attempt,
    }
}

/// Finish the running stage, or record a closed one when none is open.
fn close_stage(build: &mut Build, status: StageStatus, logs: Vec<String>, now: DateTime<Utc>) {
    if let Some(stage) = build.current_stage_mut() {
        stage.finish(status, logs, now);
        return;
    }
    if logs.is_empty() {
        return;
    }
    let attempt = build.stages.last().map(|s| s.attempt).unwrap_or(0);
    let mut stage = Stage::start("build", attempt, now);
    stage.finish(status, logs, now);
    build.stages.push(stage);
}
