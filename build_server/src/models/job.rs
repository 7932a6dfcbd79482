//! Queue jobs: one row per build in the persisted job table.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};
use crate::schema::build_jobs;

use super::request::BuildRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed once `run_at` has passed (includes retry backoff).
    Waiting,
    /// Claimed by exactly one worker.
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: i64,
    pub build_id: String,
    pub request: BuildRequest,
    pub state: JobState,
    /// Attempts started so far, including the one in progress.
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: u8,
    pub run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    /// Last renewal of the claim by its worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Result of pushing a job onto the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: i64,
    /// 1-based position among waiting jobs.
    pub position: usize,
}

#[derive(Debug, Clone, Queryable, Selectable, QueryableByName)]
#[diesel(table_name = build_jobs)]
pub struct JobRow {
    pub id: i64,
    pub build_id: String,
    pub payload: serde_json::Value,
    pub state: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub run_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = build_jobs)]
pub struct NewJobRow {
    pub build_id: String,
    pub payload: serde_json::Value,
    pub state: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub run_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = BuildError;

    fn try_from(row: JobRow) -> Result<Self> {
        let state = JobState::parse(&row.state)
            .ok_or_else(|| BuildError::Store(format!("unknown job state {}", row.state)))?;
        Ok(Self {
            job_id: row.id,
            build_id: row.build_id,
            request: serde_json::from_value(row.payload)?,
            state,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            progress: row.progress.clamp(0, 100) as u8,
            run_at: row.run_at,
            claimed_by: row.claimed_by,
            heartbeat_at: row.heartbeat_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}
