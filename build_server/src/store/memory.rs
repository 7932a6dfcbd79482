//! In-process store with the same semantics as the PostgreSQL backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{BuildError, Result};
use crate::models::{Build, BuildRequest, Deployment, Enqueued, Job, JobState};

use super::{BuildStore, DeploymentStore, JobQueue};

#[derive(Default)]
struct State {
    builds: HashMap<String, Build>,
    jobs: BTreeMap<i64, Job>,
    next_job_id: i64,
    deployments: HashMap<String, Deployment>,
}

impl State {
    fn job_mut(&mut self, build_id: &str) -> Result<&mut Job> {
        self.jobs
            .values_mut()
            .find(|job| job.build_id == build_id)
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))
    }

    fn waiting_order(&self) -> Vec<&Job> {
        let mut waiting: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting)
            .collect();
        waiting.sort_by_key(|job| (job.run_at, job.job_id));
        waiting
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn insert(&self, build: &Build) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.builds.contains_key(&build.build_id) {
            return Err(BuildError::Store(format!(
                "build {} already exists",
                build.build_id
            )));
        }
        state.builds.insert(build.build_id.clone(), build.clone());
        Ok(())
    }

    async fn get(&self, build_id: &str) -> Result<Option<Build>> {
        Ok(self.state.lock().await.builds.get(build_id).cloned())
    }

    async fn save(&self, build: &Build) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .builds
            .get_mut(&build.build_id)
            .ok_or_else(|| BuildError::NotFound(build.build_id.clone()))?;
        if stored.status.is_terminal() {
            return Err(BuildError::AlreadyTerminal(build.build_id.clone()));
        }
        *stored = build.clone();
        Ok(())
    }

    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Build>> {
        let state = self.state.lock().await;
        let mut builds: Vec<Build> = state
            .builds
            .values()
            .filter(|build| build.project_id == project_id)
            .cloned()
            .collect();
        builds.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.build_id.cmp(&a.build_id))
        });
        builds.truncate(limit);
        Ok(builds)
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Build>> {
        let state = self.state.lock().await;
        Ok(state
            .builds
            .values()
            .filter(|build| build.status.is_terminal())
            .filter(|build| build.completed_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect())
    }

    async fn delete(&self, build_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|_, job| job.build_id != build_id);
        Ok(state.builds.remove(build_id).is_some())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn push(
        &self,
        build_id: &str,
        request: &BuildRequest,
        max_attempts: u32,
    ) -> Result<Enqueued> {
        let mut state = self.state.lock().await;
        if state.jobs.values().any(|job| job.build_id == build_id) {
            return Err(BuildError::Store(format!("job for {build_id} already exists")));
        }
        state.next_job_id += 1;
        let job_id = state.next_job_id;
        let now = Utc::now();
        state.jobs.insert(
            job_id,
            Job {
                job_id,
                build_id: build_id.to_string(),
                request: request.clone(),
                state: JobState::Waiting,
                attempts: 0,
                max_attempts,
                progress: 0,
                run_at: now,
                claimed_by: None,
                heartbeat_at: None,
                last_error: None,
                created_at: now,
            },
        );
        let position = state
            .waiting_order()
            .iter()
            .position(|job| job.job_id == job_id)
            .map(|i| i + 1)
            .unwrap_or(1);
        Ok(Enqueued { job_id, position })
    }

    async fn claim(&self, worker: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let next = state
            .waiting_order()
            .into_iter()
            .find(|job| job.run_at <= now)
            .map(|job| job.job_id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.claimed_by = Some(worker.to_string());
        job.heartbeat_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn get(&self, build_id: &str) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.build_id == build_id)
            .cloned())
    }

    async fn position(&self, build_id: &str) -> Result<Option<usize>> {
        let state = self.state.lock().await;
        Ok(state
            .waiting_order()
            .iter()
            .position(|job| job.build_id == build_id)
            .map(|i| i + 1))
    }

    async fn set_progress(&self, build_id: &str, progress: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        job.progress = job.progress.max(progress.min(100));
        Ok(())
    }

    async fn retry_at(&self, build_id: &str, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        if job.state == JobState::Active {
            job.state = JobState::Waiting;
            job.run_at = run_at;
            job.claimed_by = None;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn complete(&self, build_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.claimed_by = None;
        Ok(())
    }

    async fn fail(&self, build_id: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        job.state = JobState::Failed;
        job.claimed_by = None;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn cancel_waiting(&self, build_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        if job.state != JobState::Waiting {
            return Ok(false);
        }
        job.state = JobState::Cancelled;
        Ok(true)
    }

    async fn mark_cancelled(&self, build_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        if matches!(job.state, JobState::Waiting | JobState::Active) {
            job.state = JobState::Cancelled;
            job.claimed_by = None;
        }
        Ok(())
    }

    async fn heartbeat(&self, build_id: &str, worker: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(build_id)?;
        if job.state != JobState::Active || job.claimed_by.as_deref() != Some(worker) {
            return Ok(false);
        }
        job.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn requeue_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for job in state.jobs.values_mut() {
            let expired = job.heartbeat_at.is_none_or(|at| at < cutoff);
            if job.state == JobState::Active && expired {
                job.state = JobState::Waiting;
                job.claimed_by = None;
                job.heartbeat_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn depth(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting)
            .count() as u64)
    }

    async fn delete(&self, build_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|_, job| job.build_id != build_id);
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        Ok(self
            .state
            .lock()
            .await
            .deployments
            .get(deployment_id)
            .cloned())
    }

    async fn upsert(&self, deployment: &Deployment) -> Result<()> {
        self.state
            .lock()
            .await
            .deployments
            .insert(deployment.deployment_id.clone(), deployment.clone());
        Ok(())
    }
}
