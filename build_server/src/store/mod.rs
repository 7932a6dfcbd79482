//! Persistence contracts.
//!
//! The engine only depends on these traits. [`pg::PgStore`] backs them with
//! PostgreSQL; [`memory::MemoryStore`] holds everything in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Build, BuildRequest, Deployment, Enqueued, Job};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// One document per build id.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert(&self, build: &Build) -> Result<()>;

    async fn get(&self, build_id: &str) -> Result<Option<Build>>;

    /// Overwrite the stored document.
    ///
    /// Fails with `AlreadyTerminal` when the stored document is terminal, so
    /// a finished build can never be rewritten by a late writer.
    async fn save(&self, build: &Build) -> Result<()>;

    /// Newest first.
    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Build>>;

    /// Terminal builds completed at or before `cutoff`.
    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Build>>;

    async fn delete(&self, build_id: &str) -> Result<bool>;
}

/// The persisted job table. Every mutation is keyed by build id.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, build_id: &str, request: &BuildRequest, max_attempts: u32)
        -> Result<Enqueued>;

    /// Claim the oldest runnable waiting job, moving it to `active` and
    /// counting the attempt. At most one caller ever receives a given job.
    async fn claim(&self, worker: &str) -> Result<Option<Job>>;

    async fn get(&self, build_id: &str) -> Result<Option<Job>>;

    /// 1-based position among waiting jobs, `None` unless waiting.
    async fn position(&self, build_id: &str) -> Result<Option<usize>>;

    /// Raise the stored progress; lower values are ignored.
    async fn set_progress(&self, build_id: &str, progress: u8) -> Result<()>;

    /// Return an active job to `waiting`, runnable from `run_at`.
    async fn retry_at(&self, build_id: &str, run_at: DateTime<Utc>, error: &str) -> Result<()>;

    async fn complete(&self, build_id: &str) -> Result<()>;

    async fn fail(&self, build_id: &str, error: &str) -> Result<()>;

    /// Cancel a job that is waiting. Returns `false` when it was not waiting.
    async fn cancel_waiting(&self, build_id: &str) -> Result<bool>;

    /// Mark a job cancelled whatever its state, unless already final.
    async fn mark_cancelled(&self, build_id: &str) -> Result<()>;

    /// Renew the claim `worker` holds on the job. `false` once the job is no
    /// longer active under that worker.
    async fn heartbeat(&self, build_id: &str, worker: &str) -> Result<bool>;

    /// Return active jobs whose claim was last renewed before `cutoff` to
    /// `waiting`. Claims that are still renewed are never touched.
    async fn requeue_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Number of waiting jobs.
    async fn depth(&self) -> Result<u64>;

    async fn delete(&self, build_id: &str) -> Result<()>;
}

/// Deployment records, owned by the deploy service and mirrored here.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>>;

    async fn upsert(&self, deployment: &Deployment) -> Result<()>;
}
