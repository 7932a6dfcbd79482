//! Build State Tracker: the only writer of `Build.status`.
//!
//! Each [`BuildEvent`] is folded into the stored document and saved. The
//! deployment is told afterwards, from a delivery task of its own, so a slow
//! or failing notifier never delays or reverts what was written.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BuildError, Result};
use crate::events::BuildEvent;
use crate::models::{Build, BuildStatus};
use crate::store::BuildStore;

use super::deployment_service::DeploymentNotifier;

#[derive(Debug, Clone, Copy)]
enum Milestone {
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
}

enum Delivery {
    Notice { build: Build, milestone: Milestone },
    /// Answered once everything queued before it was delivered.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct BuildTracker {
    builds: Arc<dyn BuildStore>,
    notices: mpsc::UnboundedSender<Delivery>,
}

impl BuildTracker {
    /// Must be called from within a Tokio runtime.
    pub fn new(builds: Arc<dyn BuildStore>, notifier: Arc<dyn DeploymentNotifier>) -> Self {
        let (notices, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(notifier, rx));
        Self { builds, notices }
    }

    pub async fn create(&self, build: &Build) -> Result<()> {
        self.builds.insert(build).await?;
        tracing::info!(
            build_id = %build.build_id,
            deployment_id = %build.deployment_id,
            project_id = %build.project_id,
            rebuild_from = ?build.rebuild_from,
            "Build created"
        );
        self.notify(build, Milestone::Queued);
        Ok(())
    }

    pub async fn get(&self, build_id: &str) -> Result<Option<Build>> {
        self.builds.get(build_id).await
    }

    /// Apply `event` to the stored build and persist it.
    pub async fn record(&self, build_id: &str, event: BuildEvent) -> Result<Build> {
        let mut build = self
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;

        let was_pending = build.status == BuildStatus::Pending;
        let name = event.name();
        let milestone = match &event {
            BuildEvent::AttemptStarted { .. } if was_pending => Some(Milestone::Started),
            BuildEvent::AttemptStarted { .. } | BuildEvent::AttemptFailed { .. } => None,
            BuildEvent::BuildSucceeded { .. } => Some(Milestone::Completed),
            BuildEvent::BuildFailed { .. } => Some(Milestone::Failed),
            BuildEvent::BuildCancelled { .. } => Some(Milestone::Cancelled),
        };

        event.apply(&mut build, Utc::now())?;
        self.builds.save(&build).await?;

        tracing::info!(
            build_id,
            event = name,
            status = %build.status,
            retry_count = build.retry_count,
            "Build updated"
        );

        if build.status.is_terminal() {
            crate::metrics::build_status_changed(build.status.as_str());
            if let Some(ms) = build.duration_ms {
                crate::metrics::build_duration(ms.max(0) as u64);
            }
        }

        if let Some(milestone) = milestone {
            self.notify(&build, milestone);
        }
        Ok(build)
    }

    /// Wait until every notification recorded so far was delivered.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.notices.send(Delivery::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn notify(&self, build: &Build, milestone: Milestone) {
        let notice = Delivery::Notice {
            build: build.clone(),
            milestone,
        };
        if self.notices.send(notice).is_err() {
            tracing::warn!(build_id = %build.build_id, ?milestone, "Deployment notifier gone, notification dropped");
        }
    }
}

/// Deliver notices one at a time, in the order they were recorded.
async fn deliver(notifier: Arc<dyn DeploymentNotifier>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        let (build, milestone) = match delivery {
            Delivery::Notice { build, milestone } => (build, milestone),
            Delivery::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let result = match milestone {
            Milestone::Queued => notifier.build_queued(&build).await,
            Milestone::Started => notifier.build_started(&build).await,
            Milestone::Completed => match build.artifacts.last() {
                Some(artifact) => notifier.build_completed(&build, artifact).await,
                None => Ok(()),
            },
            Milestone::Failed => match &build.error {
                Some(error) => notifier.build_failed(&build, error).await,
                None => Ok(()),
            },
            Milestone::Cancelled => notifier.build_cancelled(&build).await,
        };
        if let Err(e) = result {
            tracing::warn!(
                build_id = %build.build_id,
                deployment_id = %build.deployment_id,
                ?milestone,
                "Deployment notification failed: {e}"
            );
        }
    }
}
