//! Build Scheduler: the front of the durable job queue and its worker pool.
//!
//! Workers claim jobs from the persisted table (claiming is exclusive), run
//! one attempt through the pipeline and report the outcome to the tracker.
//! Retryable failures go back to the table with an exponential backoff;
//! everything else is final.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, Result};
use crate::events::{BuildEvent, QueueEvent};
use crate::models::{
    Build, BuildLogs, BuildRequest, BuildStatus, BuildStatusView, FailureSummary, Job,
};
use crate::store::{BuildStore, JobQueue};

use super::pipeline::{AttemptOutcome, BuildPipeline};
use super::script_generator::{self, StepLimits};
use super::tracker::BuildTracker;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_base: Duration,
    pub poll_interval: Duration,
    /// A claim not renewed within this window is returned to the queue.
    pub claim_lease: Duration,
    pub step_limits: StepLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_retries: crate::models::build::DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(60),
            step_limits: StepLimits::default(),
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry `n` (1-based): `base * 2^(n-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1 << exp)
    }

    /// Claims are renewed three times per lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.claim_lease / 3).max(Duration::from_millis(10))
    }
}

/// Result of queueing a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedBuild {
    pub build_id: String,
    pub job_id: i64,
    pub status: &'static str,
    pub queue_position: usize,
}

struct Inner {
    builds: Arc<dyn BuildStore>,
    queue: Arc<dyn JobQueue>,
    tracker: BuildTracker,
    pipeline: BuildPipeline,
    config: SchedulerConfig,
    /// Cancellation handles of attempts executing in this process.
    running: Mutex<HashMap<String, CancellationToken>>,
    events: broadcast::Sender<QueueEvent>,
    wake: Notify,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        queue: Arc<dyn JobQueue>,
        tracker: BuildTracker,
        pipeline: BuildPipeline,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                builds,
                queue,
                tracker,
                pipeline,
                config,
                running: Mutex::new(HashMap::new()),
                events,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Validate, record and queue a build.
    ///
    /// Configuration errors surface here and no build is recorded.
    pub async fn enqueue(&self, request: BuildRequest) -> Result<QueuedBuild> {
        script_generator::generate(&request, self.inner.config.step_limits)?;
        self.inner.pipeline.local_source(&request).await?;

        let build_id = uuid::Uuid::new_v4().to_string();
        let build = Build::new(build_id.clone(), request, self.inner.config.max_retries);
        self.inner.tracker.create(&build).await?;

        let enqueued = self
            .inner
            .queue
            .push(&build_id, &build.request, self.inner.config.max_retries + 1)
            .await?;

        tracing::info!(
            build_id = %build_id,
            job_id = enqueued.job_id,
            position = enqueued.position,
            project_type = build.request.project_type.label(),
            "Build queued"
        );
        self.inner.publish(QueueEvent::Enqueued {
            build_id: build_id.clone(),
            position: enqueued.position,
        });
        self.inner.update_depth().await;
        self.inner.wake.notify_one();

        Ok(QueuedBuild {
            build_id,
            job_id: enqueued.job_id,
            status: "queued",
            queue_position: enqueued.position,
        })
    }

    /// Queue a new build of the same source as `build_id`, linked to it.
    pub async fn rebuild(&self, build_id: &str) -> Result<QueuedBuild> {
        let original = self
            .inner
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;
        let mut request = original.request;
        request.rebuild_from = Some(original.build_id);
        self.enqueue(request).await
    }

    pub async fn get_build_status(&self, build_id: &str) -> Result<Option<BuildStatusView>> {
        let Some(build) = self.inner.builds.get(build_id).await? else {
            return Ok(None);
        };
        let job = self.inner.queue.get(build_id).await?;

        let progress = match build.status {
            BuildStatus::Success => 100,
            _ => job.as_ref().map(|j| j.progress).unwrap_or(0),
        };
        let queue_position = if build.status == BuildStatus::Pending {
            self.inner.queue.position(build_id).await?
        } else {
            None
        };

        Ok(Some(BuildStatusView {
            build_id: build.build_id,
            status: build.status,
            progress,
            queue_position,
            retry_count: build.retry_count,
            started_at: build.started_at,
            completed_at: build.completed_at,
            duration_ms: build.duration_ms,
            artifacts: build.artifacts,
            error: build.error,
            rebuild_from: build.rebuild_from,
        }))
    }

    pub async fn get_build_logs(&self, build_id: &str) -> Result<BuildLogs> {
        Ok(match self.inner.builds.get(build_id).await? {
            Some(build) => BuildLogs {
                build_id: build_id.to_string(),
                logs: build.render_logs(),
                exists: true,
            },
            None => BuildLogs {
                build_id: build_id.to_string(),
                logs: String::new(),
                exists: false,
            },
        })
    }

    pub async fn list_builds(&self, project_id: &str, limit: usize) -> Result<Vec<Build>> {
        self.inner.builds.list_for_project(project_id, limit).await
    }

    /// Cancel a pending or running build.
    ///
    /// A waiting job is removed from the queue before any worker sees it; a
    /// running attempt is signalled and records the cancellation itself.
    pub async fn cancel(&self, build_id: &str) -> Result<()> {
        let build = self
            .inner
            .builds
            .get(build_id)
            .await?
            .ok_or_else(|| BuildError::NotFound(build_id.to_string()))?;
        if build.status.is_terminal() {
            return Err(BuildError::AlreadyTerminal(build_id.to_string()));
        }

        if self.inner.queue.cancel_waiting(build_id).await? {
            self.inner
                .tracker
                .record(build_id, BuildEvent::BuildCancelled { logs: Vec::new() })
                .await?;
            tracing::info!(build_id, "Waiting build cancelled");
            self.inner.publish(QueueEvent::Cancelled {
                build_id: build_id.to_string(),
            });
            self.inner.update_depth().await;
            return Ok(());
        }

        if let Some(token) = self.inner.running_token(build_id) {
            tracing::info!(build_id, "Signalling running build to stop");
            token.cancel();
            return Ok(());
        }

        // Claimed but not started yet: the worker finds the build terminal.
        // A worker elsewhere loses its claim and stops at its next heartbeat.
        self.inner
            .tracker
            .record(build_id, BuildEvent::BuildCancelled { logs: Vec::new() })
            .await?;
        self.inner.queue.mark_cancelled(build_id).await?;
        // The attempt may have started here between the lookup above and the record.
        if let Some(token) = self.inner.running_token(build_id) {
            token.cancel();
        }
        tracing::info!(build_id, "Claimed build cancelled before start");
        self.inner.publish(QueueEvent::Cancelled {
            build_id: build_id.to_string(),
        });
        Ok(())
    }

    /// Wait for pending deployment notifications to be delivered.
    pub async fn flush_notifications(&self) {
        self.inner.tracker.flush().await;
    }

    /// Return jobs whose claim lapsed (their worker died) to the queue.
    pub async fn requeue_expired(&self) -> Result<u64> {
        self.inner.requeue_expired().await
    }

    /// Spawn the worker pool and the expired-claim reaper.
    pub fn start(&self) {
        let mut workers = self.inner.lock_workers();
        let process = uuid::Uuid::new_v4().simple().to_string();
        for n in 0..self.inner.config.concurrency.max(1) {
            let inner = Arc::clone(&self.inner);
            let worker_id = format!("{}-{}-{n}", hostname(), &process[..8]);
            workers.push(tokio::spawn(async move { inner.worker_loop(worker_id).await }));
        }
        let inner = Arc::clone(&self.inner);
        workers.push(tokio::spawn(async move { inner.reap_loop().await }));
        tracing::info!(
            concurrency = self.inner.config.concurrency,
            max_retries = self.inner.config.max_retries,
            "Build workers started"
        );
    }

    /// Stop claiming, wait for in-flight attempts up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.wake.notify_waiters();
        let workers: Vec<JoinHandle<()>> = self.inner.lock_workers().drain(..).collect();
        let all = futures_join(workers);
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!("Workers still busy after shutdown grace period; jobs will be requeued on restart");
        } else {
            tracing::info!("Build workers stopped");
        }
    }
}

async fn futures_join(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string())
}

/// Keeps a claim alive while its attempt runs.
///
/// When a renewal finds the claim gone (requeued as expired, or cancelled by
/// another process) the attempt is cancelled and its outcome must be dropped.
struct ClaimKeeper {
    handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl ClaimKeeper {
    /// Stop renewing. Returns whether the claim was lost.
    async fn stop(mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for ClaimKeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Unregisters a running attempt when the worker is done with it.
struct RunningGuard<'a> {
    inner: &'a Inner,
    build_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock_running().remove(&self.build_id);
        crate::metrics::active_builds(self.inner.lock_running().len());
    }
}

impl Inner {
    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running_token(&self, build_id: &str) -> Option<CancellationToken> {
        self.lock_running().get(build_id).cloned()
    }

    async fn update_depth(&self) {
        match self.queue.depth().await {
            Ok(depth) => crate::metrics::queue_depth(depth),
            Err(e) => tracing::debug!("Queue depth unavailable: {e}"),
        }
    }

    async fn requeue_expired(&self) -> Result<u64> {
        let lease = chrono_delay(self.config.claim_lease);
        let requeued = self.queue.requeue_expired(Utc::now() - lease).await?;
        if requeued > 0 {
            tracing::warn!(requeued, "Returned jobs with lapsed claims to the queue");
            self.update_depth().await;
            self.wake.notify_waiters();
        }
        Ok(requeued)
    }

    async fn reap_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.requeue_expired().await {
                tracing::error!("Expired claim sweep failed: {e}");
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.claim_lease) => {}
            }
        }
    }

    fn keep_claim(&self, build_id: &str, worker_id: &str, token: &CancellationToken) -> ClaimKeeper {
        let lost = Arc::new(AtomicBool::new(false));
        let queue = Arc::clone(&self.queue);
        let every = self.config.heartbeat_interval();
        let (build_id, worker_id, token, flag) =
            (build_id.to_string(), worker_id.to_string(), token.clone(), Arc::clone(&lost));
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                match queue.heartbeat(&build_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(build_id = %build_id, worker = %worker_id, "Claim lost, stopping attempt");
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                        break;
                    }
                    Err(e) => tracing::debug!(build_id = %build_id, "Claim not renewed: {e}"),
                }
            }
        });
        ClaimKeeper {
            handle: Some(handle),
            lost,
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        tracing::debug!(worker = %worker_id, "Worker started");
        while !self.shutdown.is_cancelled() {
            match self.queue.claim(&worker_id).await {
                Ok(Some(job)) => {
                    self.update_depth().await;
                    self.process(job, &worker_id).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker = %worker_id, "Queue claim failed: {e}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = %worker_id, "Worker stopped");
    }

    async fn process(&self, job: Job, worker_id: &str) {
        let build_id = job.build_id.clone();
        let attempt = job.attempts;

        let token = CancellationToken::new();
        {
            let mut running = self.lock_running();
            if running.contains_key(&build_id) {
                tracing::error!(build_id = %build_id, "Build already executing in this process, claim dropped");
                return;
            }
            running.insert(build_id.clone(), token.clone());
            crate::metrics::active_builds(running.len());
        }
        let _guard = RunningGuard {
            inner: self,
            build_id: build_id.clone(),
        };
        let keeper = self.keep_claim(&build_id, worker_id, &token);

        match self
            .tracker
            .record(&build_id, BuildEvent::AttemptStarted { attempt })
            .await
        {
            Ok(_) => {}
            Err(BuildError::StaleAttempt { .. }) => {
                tracing::error!(build_id = %build_id, attempt, "Attempt already started elsewhere, claim dropped");
                return;
            }
            Err(BuildError::AlreadyTerminal(_)) => {
                tracing::info!(build_id = %build_id, "Build already finished, job dropped");
                self.settle(self.queue.mark_cancelled(&build_id).await, &build_id);
                return;
            }
            Err(BuildError::NotFound(_)) => {
                tracing::warn!(build_id = %build_id, "Job without a build record, discarded");
                self.settle(self.queue.fail(&build_id, "build record missing").await, &build_id);
                return;
            }
            Err(e) => {
                tracing::error!(build_id = %build_id, "Could not start attempt: {e}");
                let run_at = Utc::now() + chrono_delay(self.config.poll_interval);
                self.settle(self.queue.retry_at(&build_id, run_at, &e.to_string()).await, &build_id);
                return;
            }
        }

        tracing::info!(build_id = %build_id, attempt, worker = worker_id, "Attempt started");

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let forwarder = self.forward_progress(build_id.clone(), job.progress, progress_rx);

        let outcome = self
            .pipeline
            .run_attempt(&build_id, attempt, &job.request, &token, &progress_tx)
            .await;
        let lost = keeper.stop().await;
        drop(progress_tx);
        forwarder.await;

        if lost {
            tracing::warn!(build_id = %build_id, attempt, "Claim lost during the attempt, outcome discarded");
            return;
        }
        self.finish(&job, outcome, &token).await;
    }

    /// Persist and publish progress advances for one attempt.
    ///
    /// Every attempt estimates from zero; only values above what the build
    /// already reached (`floor`) are forwarded.
    fn forward_progress(
        &self,
        build_id: String,
        floor: u8,
        mut rx: watch::Receiver<u8>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let queue = Arc::clone(&self.queue);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let mut high = floor;
            while rx.changed().await.is_ok() {
                let progress = *rx.borrow_and_update();
                if progress <= high {
                    continue;
                }
                high = progress;
                if let Err(e) = queue.set_progress(&build_id, progress).await {
                    tracing::debug!(build_id = %build_id, "Progress not persisted: {e}");
                }
                let _ = events.send(QueueEvent::Progress {
                    build_id: build_id.clone(),
                    progress,
                });
            }
        });
        async move {
            let _ = handle.await;
        }
    }

    async fn finish(&self, job: &Job, outcome: AttemptOutcome, token: &CancellationToken) {
        let build_id = job.build_id.as_str();
        let attempt = job.attempts;
        let AttemptOutcome { logs, result } = outcome;

        match result {
            Ok((artifact, cache)) => {
                match self
                    .tracker
                    .record(build_id, BuildEvent::BuildSucceeded { artifact: artifact.clone(), cache, logs })
                    .await
                {
                    Ok(_) => {
                        self.settle(self.queue.complete(build_id).await, build_id);
                        tracing::info!(build_id, attempt, artifact = %artifact.path, "Build succeeded");
                        self.publish(QueueEvent::Completed {
                            build_id: build_id.to_string(),
                        });
                    }
                    Err(e) => {
                        // Cancelled while packaging: the artifact has no owner.
                        tracing::warn!(build_id, "Success not recorded: {e}");
                        if let Err(e) = self.pipeline.packager.remove(&artifact).await {
                            tracing::warn!(build_id, "Orphaned artifact not removed: {e}");
                        }
                        self.settle(self.queue.mark_cancelled(build_id).await, build_id);
                    }
                }
            }
            Err(BuildError::Cancelled) => {
                self.record_cancelled(build_id, logs).await;
            }
            Err(err) => {
                let summary = FailureSummary::from(&err);
                let will_retry = err.is_retryable() && job.has_attempts_left();
                tracing::warn!(
                    build_id,
                    attempt,
                    reason = err.reason(),
                    will_retry,
                    "Attempt failed: {err}"
                );
                self.publish(QueueEvent::Failed {
                    build_id: build_id.to_string(),
                    reason: summary.reason.clone(),
                    attempt,
                    will_retry,
                });

                if will_retry {
                    crate::metrics::build_retry(err.reason());
                    let recorded = self
                        .tracker
                        .record(
                            build_id,
                            BuildEvent::AttemptFailed {
                                attempt,
                                error: summary,
                                logs,
                            },
                        )
                        .await;
                    if let Err(e) = recorded {
                        tracing::warn!(build_id, "Retry not recorded: {e}");
                        self.settle(self.queue.mark_cancelled(build_id).await, build_id);
                        return;
                    }

                    let delay = self.config.backoff(attempt);
                    let run_at = Utc::now() + chrono_delay(delay);
                    self.settle(
                        self.queue.retry_at(build_id, run_at, &err.to_string()).await,
                        build_id,
                    );
                    tracing::info!(build_id, next_attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retry scheduled");

                    // A cancel that raced the bookkeeping above found no waiting job.
                    if token.is_cancelled() {
                        if let Ok(true) = self.queue.cancel_waiting(build_id).await {
                            self.record_cancelled(build_id, Vec::new()).await;
                        }
                    }
                } else {
                    let message = err.to_string();
                    match self
                        .tracker
                        .record(build_id, BuildEvent::BuildFailed { error: summary, logs })
                        .await
                    {
                        Ok(_) => tracing::info!(build_id, attempt, "Build failed"),
                        Err(e) => tracing::warn!(build_id, "Failure not recorded: {e}"),
                    }
                    self.settle(self.queue.fail(build_id, &message).await, build_id);
                }
            }
        }
    }

    async fn record_cancelled(&self, build_id: &str, logs: Vec<String>) {
        match self
            .tracker
            .record(build_id, BuildEvent::BuildCancelled { logs })
            .await
        {
            Ok(_) | Err(BuildError::AlreadyTerminal(_)) => {}
            Err(e) => tracing::warn!(build_id, "Cancellation not recorded: {e}"),
        }
        self.settle(self.queue.mark_cancelled(build_id).await, build_id);
        tracing::info!(build_id, "Build cancelled");
        self.publish(QueueEvent::Cancelled {
            build_id: build_id.to_string(),
        });
    }

    fn settle(&self, result: Result<()>, build_id: &str) {
        if let Err(e) = result {
            tracing::error!(build_id, "Job table update failed: {e}");
        }
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1))
}
