//! Retention sweep: purge terminal builds older than the horizon, artifacts
//! first. A build whose artifact cannot be deleted is kept for the next sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::{BuildStore, JobQueue};

use super::artifact_service::ArtifactPackager;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub swept: usize,
    /// Expired builds kept because an artifact could not be removed.
    pub retained: usize,
}

pub struct RetentionSweeper {
    builds: Arc<dyn BuildStore>,
    queue: Arc<dyn JobQueue>,
    packager: ArtifactPackager,
    horizon: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        queue: Arc<dyn JobQueue>,
        packager: ArtifactPackager,
        horizon: chrono::Duration,
    ) -> Self {
        Self {
            builds,
            queue,
            packager,
            horizon,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.horizon;
        let expired = self.builds.list_expired(cutoff).await?;
        let mut report = SweepReport::default();

        for build in expired {
            let mut artifacts_gone = true;
            for artifact in &build.artifacts {
                if let Err(e) = self.packager.remove(artifact).await {
                    artifacts_gone = false;
                    tracing::warn!(
                        build_id = %build.build_id,
                        path = %artifact.path,
                        "Artifact removal failed, build kept: {e}"
                    );
                }
            }
            if !artifacts_gone {
                report.retained += 1;
                continue;
            }

            let removed = async {
                self.queue.delete(&build.build_id).await?;
                self.builds.delete(&build.build_id).await
            }
            .await;
            match removed {
                Ok(_) => {
                    report.swept += 1;
                    tracing::info!(
                        build_id = %build.build_id,
                        status = %build.status,
                        completed_at = ?build.completed_at,
                        "Build swept"
                    );
                }
                Err(e) => {
                    report.retained += 1;
                    tracing::warn!(build_id = %build.build_id, "Build record removal failed: {e}");
                }
            }
        }

        crate::metrics::builds_swept(report.swept);
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown`.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            horizon_days = self.horizon.num_days(),
            interval_secs = interval.as_secs(),
            "Retention sweeper started"
        );
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report.swept > 0 || report.retained > 0 => {
                            tracing::info!(swept = report.swept, retained = report.retained, "Retention sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Retention sweep failed: {e}"),
                    }
                }
            }
        }
    }
}
