//! Deployment notification.
//!
//! The tracker reports build milestones to a [`DeploymentNotifier`]. The
//! store-backed notifier keeps the deployment record in step; the HTTP
//! notifier forwards the same milestones to the deploy service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::error::{BuildError, Result};
use crate::models::{Artifact, Build, Deployment, DeploymentStatus, FailureSummary};
use crate::store::DeploymentStore;

#[async_trait]
pub trait DeploymentNotifier: Send + Sync {
    async fn build_queued(&self, _build: &Build) -> Result<()> {
        Ok(())
    }

    async fn build_started(&self, build: &Build) -> Result<()>;

    /// Success hands the deployment on to its deploy phase.
    async fn build_completed(&self, build: &Build, artifact: &Artifact) -> Result<()>;

    async fn build_failed(&self, build: &Build, error: &FailureSummary) -> Result<()>;

    async fn build_cancelled(&self, _build: &Build) -> Result<()> {
        Ok(())
    }
}

// ── Store-backed ──

pub struct StoreDeploymentNotifier {
    store: Arc<dyn DeploymentStore>,
}

impl StoreDeploymentNotifier {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Load (or create) the deployment and apply `update`, unless the
    /// deployment has since moved on to a different build.
    async fn update(
        &self,
        build: &Build,
        update: impl FnOnce(&mut Deployment) + Send,
    ) -> Result<()> {
        let mut deployment = self
            .store
            .get(&build.deployment_id)
            .await?
            .unwrap_or_else(|| Deployment::queued(&build.deployment_id, &build.project_id));

        if deployment
            .build_id
            .as_deref()
            .is_some_and(|owner| owner != build.build_id)
            && deployment.status != DeploymentStatus::Queued
        {
            tracing::debug!(
                deployment_id = %deployment.deployment_id,
                build_id = %build.build_id,
                owner = ?deployment.build_id,
                "Deployment owned by another build, not updated"
            );
            return Ok(());
        }

        deployment.build_id = Some(build.build_id.clone());
        update(&mut deployment);
        deployment.updated_at = Utc::now();
        self.store.upsert(&deployment).await
    }
}

#[async_trait]
impl DeploymentNotifier for StoreDeploymentNotifier {
    async fn build_queued(&self, build: &Build) -> Result<()> {
        self.update(build, |d| {
            d.status = DeploymentStatus::Queued;
            d.error_message = None;
        })
        .await
    }

    async fn build_started(&self, build: &Build) -> Result<()> {
        let started = build.started_at;
        self.update(build, move |d| {
            d.status = DeploymentStatus::Building;
            d.build_started_at = started;
        })
        .await
    }

    async fn build_completed(&self, build: &Build, artifact: &Artifact) -> Result<()> {
        let finished = build.completed_at;
        let path = artifact.path.clone();
        self.update(build, move |d| {
            d.status = DeploymentStatus::Deploying;
            d.artifact_path = Some(path);
            d.build_finished_at = finished;
            d.error_message = None;
        })
        .await
    }

    async fn build_failed(&self, build: &Build, error: &FailureSummary) -> Result<()> {
        let finished = build.completed_at;
        let message = error.message.clone();
        self.update(build, move |d| {
            d.status = DeploymentStatus::Failed;
            d.error_message = Some(message);
            d.build_finished_at = finished;
        })
        .await
    }

    async fn build_cancelled(&self, build: &Build) -> Result<()> {
        let finished = build.completed_at;
        self.update(build, move |d| {
            d.status = DeploymentStatus::Cancelled;
            d.build_finished_at = finished;
        })
        .await
    }
}

// ── HTTP callback ──

#[derive(Debug, Serialize)]
struct CallbackPayload<'a> {
    event: &'a str,
    deployment_id: &'a str,
    project_id: &'a str,
    build_id: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<&'a Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a FailureSummary>,
}

pub struct HttpDeploymentNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpDeploymentNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BuildError::Configuration(format!("deployment callback client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(
        &self,
        event: &str,
        build: &Build,
        artifact: Option<&Artifact>,
        error: Option<&FailureSummary>,
    ) -> Result<()> {
        let payload = CallbackPayload {
            event,
            deployment_id: &build.deployment_id,
            project_id: &build.project_id,
            build_id: &build.build_id,
            status: build.status.as_str(),
            artifact,
            error,
        };
        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BuildError::Store(format!("deployment callback {event}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentNotifier for HttpDeploymentNotifier {
    async fn build_started(&self, build: &Build) -> Result<()> {
        self.post("build_started", build, None, None).await
    }

    async fn build_completed(&self, build: &Build, artifact: &Artifact) -> Result<()> {
        self.post("build_completed", build, Some(artifact), None).await
    }

    async fn build_failed(&self, build: &Build, error: &FailureSummary) -> Result<()> {
        self.post("build_failed", build, None, Some(error)).await
    }

    async fn build_cancelled(&self, build: &Build) -> Result<()> {
        self.post("build_cancelled", build, None, None).await
    }
}

// ── Fan-out ──

/// Delivers to every notifier; reports the first failure after trying all.
#[derive(Default, Clone)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn DeploymentNotifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn DeploymentNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

#[async_trait]
impl DeploymentNotifier for NotifierSet {
    async fn build_queued(&self, build: &Build) -> Result<()> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push(notifier.build_queued(build).await);
        }
        first_error(results)
    }

    async fn build_started(&self, build: &Build) -> Result<()> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push(notifier.build_started(build).await);
        }
        first_error(results)
    }

    async fn build_completed(&self, build: &Build, artifact: &Artifact) -> Result<()> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push(notifier.build_completed(build, artifact).await);
        }
        first_error(results)
    }

    async fn build_failed(&self, build: &Build, error: &FailureSummary) -> Result<()> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push(notifier.build_failed(build, error).await);
        }
        first_error(results)
    }

    async fn build_cancelled(&self, build: &Build) -> Result<()> {
        let mut results = Vec::with_capacity(self.notifiers.len());
        for notifier in &self.notifiers {
            results.push(notifier.build_cancelled(build).await);
        }
        first_error(results)
    }
}
