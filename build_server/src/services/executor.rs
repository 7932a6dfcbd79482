//! Sandboxed executor: runs one generated script in a throwaway container.
//!
//! Output is consumed line by line as a single ordered stream feeding the
//! progress estimator and the bounded log buffer. The run ends on container
//! exit, wall-clock timeout or cancellation; the container is torn down in
//! every case.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::BuildError;

use super::progress::{strip_ansi, LogBuffer, ProgressEstimator};
use super::sandbox::{ContainerRuntime, ContainerSpec, NetworkMode, ResourceLimits, SandboxLease};
use super::script_generator::{
    StepLimits, CHECKOUT_FAILED_EXIT, CLONE_FAILED_EXIT, SIGTERM_EXIT, STEP_TIMEOUT_EXIT,
    SUCCESS_SENTINEL, WORKSPACE_MOUNT,
};

pub const SCRIPT_NAME: &str = "build.sh";

/// Everything needed to run one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub build_id: String,
    pub attempt: u32,
    pub script: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    /// Host workspace, mounted at `/workspace`.
    pub workspace: PathBuf,
    pub source: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ExecutionResult {
    /// `None` when the container never exited on its own.
    pub exit_code: Option<i64>,
    pub logs: Vec<String>,
    pub duration: Duration,
    pub failure: Option<BuildError>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    fn failed(err: BuildError, logs: Vec<String>, started: Instant) -> Self {
        Self {
            exit_code: err.exit_code(),
            logs,
            duration: started.elapsed(),
            failure: Some(err),
        }
    }
}

enum Stop {
    Exited(i64),
    Lost(BuildError),
    Cancelled,
    TimedOut,
}

pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    run_timeout: Duration,
    step_limits: StepLimits,
    max_log_lines: usize,
}

impl Executor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        run_timeout: Duration,
        step_limits: StepLimits,
        max_log_lines: usize,
    ) -> Self {
        Self {
            runtime,
            run_timeout,
            step_limits,
            max_log_lines,
        }
    }

    /// Run `request.script`, blocking until the container is gone.
    ///
    /// Progress advances are published on `progress`; a triggered `cancel`
    /// kills the container and yields [`BuildError::Cancelled`].
    pub async fn run(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
        progress: &watch::Sender<u8>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut buffer = LogBuffer::new(self.max_log_lines);

        if let Err(e) = write_script(&request.workspace, &request.script).await {
            return ExecutionResult::failed(e, buffer.into_lines(), started);
        }

        let spec = ContainerSpec {
            name: format!("shipyard-build-{}-{}", request.build_id, request.attempt),
            image: request.image.clone(),
            workspace: request.workspace.clone(),
            source: request.source.clone(),
            env: request.env.clone(),
            limits: request.limits,
            network: request.network.clone(),
            command: vec!["sh".into(), format!("{WORKSPACE_MOUNT}/{SCRIPT_NAME}")],
        };

        tracing::info!(
            build_id = %request.build_id,
            attempt = request.attempt,
            image = %request.image,
            network = ?request.network,
            "Starting execution environment"
        );

        let lease = match SandboxLease::acquire(Arc::clone(&self.runtime), &spec).await {
            Ok(lease) => lease,
            Err(e) => return ExecutionResult::failed(e, buffer.into_lines(), started),
        };

        let stop = self
            .drive(&lease, &request, cancel, progress, &mut buffer)
            .await;

        if matches!(stop, Stop::Cancelled | Stop::TimedOut) {
            if let Err(e) = lease.kill().await {
                tracing::warn!(build_id = %request.build_id, "Kill failed: {e}");
            }
        }
        // Removal failures are logged by the lease; they do not change the outcome.
        let _ = lease.release().await;

        let duration = started.elapsed();
        let (exit_code, failure) = match stop {
            Stop::Cancelled => (None, Some(BuildError::Cancelled)),
            Stop::TimedOut => {
                buffer.push(format!(
                    "error: build exceeded {}s and was stopped",
                    self.run_timeout.as_secs()
                ));
                (
                    None,
                    Some(BuildError::Timeout {
                        stage: "run".into(),
                        limit: self.run_timeout,
                    }),
                )
            }
            Stop::Lost(e) => (None, Some(e)),
            Stop::Exited(code) => (Some(code), self.classify(code, &buffer)),
        };

        tracing::info!(
            build_id = %request.build_id,
            attempt = request.attempt,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            outcome = failure.as_ref().map(BuildError::reason).unwrap_or("success"),
            "Execution finished"
        );

        ExecutionResult {
            exit_code,
            logs: buffer.into_lines(),
            duration,
            failure,
        }
    }

    async fn drive(
        &self,
        lease: &SandboxLease,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        progress: &watch::Sender<u8>,
        buffer: &mut LogBuffer,
    ) -> Stop {
        let mut running = match lease.start().await {
            Ok(running) => running,
            Err(e) => return Stop::Lost(e),
        };

        let mut estimator = ProgressEstimator::new();
        let deadline = tokio::time::sleep(self.run_timeout);
        tokio::pin!(deadline);
        let mut output_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Stop::Cancelled,
                _ = &mut deadline => return Stop::TimedOut,
                line = running.output.recv(), if output_open => match line {
                    Some(line) => {
                        let line = strip_ansi(&line);
                        if let Some(value) = estimator.observe(&line) {
                            progress.send_replace(value);
                        }
                        tracing::trace!(build_id = %request.build_id, "{line}");
                        buffer.push(line);
                    }
                    None => output_open = false,
                },
                exit = &mut running.exit, if !output_open => {
                    return match exit {
                        Ok(Ok(code)) => Stop::Exited(code),
                        Ok(Err(e)) => Stop::Lost(e),
                        Err(e) => Stop::Lost(BuildError::Runtime(format!("exit watcher failed: {e}"))),
                    };
                }
            }
        }
    }

    /// Map an exit code onto the failure taxonomy.
    fn classify(&self, code: i64, buffer: &LogBuffer) -> Option<BuildError> {
        let detail = || {
            buffer
                .last_error_line()
                .unwrap_or("build script failed")
                .to_string()
        };
        match code {
            0 if buffer.contains(SUCCESS_SENTINEL) => None,
            0 => Some(BuildError::Execution {
                exit_code: 0,
                message: "script exited without reporting success".into(),
            }),
            CLONE_FAILED_EXIT => Some(BuildError::Clone(detail())),
            CHECKOUT_FAILED_EXIT => Some(BuildError::Clone(detail())),
            STEP_TIMEOUT_EXIT | SIGTERM_EXIT => {
                let fetching = buffer
                    .last_error_line()
                    .is_some_and(|line| line.contains("git fetch"));
                Some(if fetching {
                    BuildError::Timeout {
                        stage: "checkout".into(),
                        limit: Duration::from_secs(self.step_limits.checkout_secs),
                    }
                } else {
                    BuildError::Timeout {
                        stage: "clone".into(),
                        limit: Duration::from_secs(self.step_limits.clone_secs),
                    }
                })
            }
            other => Some(BuildError::Execution {
                exit_code: other,
                message: detail(),
            }),
        }
    }
}

async fn write_script(workspace: &Path, script: &str) -> crate::error::Result<()> {
    tokio::fs::create_dir_all(workspace).await?;
    tokio::fs::write(workspace.join(SCRIPT_NAME), script).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::services::sandbox::RunningContainer;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};

    /// Emits fixed lines then exits with `code`; `hang` waits for a kill instead.
    struct Scripted {
        lines: Vec<String>,
        code: i64,
        hang: bool,
        killed: Arc<Notify>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(lines: &[&str], code: i64) -> Arc<Self> {
            Arc::new(Self {
                lines: lines.iter().map(|s| s.to_string()).collect(),
                code,
                hang: false,
                killed: Arc::new(Notify::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                lines: vec!["==> Cloning repository".into()],
                code: 0,
                hang: true,
                killed: Arc::new(Notify::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for Scripted {
        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            self.calls.lock().unwrap().push("create".into());
            Ok(spec.name.clone())
        }

        async fn start_attached(&self, _id: &str) -> Result<RunningContainer> {
            let (tx, rx) = mpsc::channel(16);
            let lines = self.lines.clone();
            let code = self.code;
            let hang = self.hang;
            let killed = Arc::clone(&self.killed);
            let exit = tokio::spawn(async move {
                for line in lines {
                    let _ = tx.send(line).await;
                }
                if hang {
                    killed.notified().await;
                    return Ok(137);
                }
                drop(tx);
                Ok(code)
            });
            Ok(RunningContainer { output: rx, exit })
        }

        async fn kill(&self, _id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("kill".into());
            self.killed.notify_one();
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            self.calls.lock().unwrap().push("remove".into());
            Ok(())
        }
    }

    fn request(workspace: &Path) -> ExecutionRequest {
        ExecutionRequest {
            build_id: "b1".into(),
            attempt: 1,
            script: "#!/bin/sh\necho hi\n".into(),
            image: "nginx:alpine".into(),
            env: Vec::new(),
            limits: ResourceLimits::default(),
            network: NetworkMode::Disabled,
            workspace: workspace.to_path_buf(),
            source: None,
        }
    }

    fn executor(runtime: Arc<Scripted>, timeout: Duration) -> Executor {
        Executor::new(runtime, timeout, StepLimits::default(), 100)
    }

    #[tokio::test]
    async fn success_requires_sentinel() {
        let ws = tempfile::tempdir().unwrap();
        let runtime = Scripted::new(&["==> Building", SUCCESS_SENTINEL], 0);
        let (tx, rx) = watch::channel(0);

        let result = executor(runtime.clone(), Duration::from_secs(5))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;

        assert!(result.succeeded(), "{:?}", result.failure);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(*rx.borrow(), 100);
        assert!(ws.path().join(SCRIPT_NAME).exists());
        assert_eq!(runtime.calls(), vec!["create", "remove"]);

        let silent = Scripted::new(&["==> Building"], 0);
        let result = executor(silent, Duration::from_secs(5))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;
        assert!(matches!(result.failure, Some(BuildError::Execution { exit_code: 0, .. })));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code_and_log() {
        let ws = tempfile::tempdir().unwrap();
        let runtime = Scripted::new(&["==> Building", "npm ERR! error: missing script: build"], 1);
        let (tx, _rx) = watch::channel(0);

        let result = executor(runtime.clone(), Duration::from_secs(5))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;

        match result.failure {
            Some(BuildError::Execution { exit_code, message }) => {
                assert_eq!(exit_code, 1);
                assert!(message.contains("missing script"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(result.logs.len(), 2);
        assert_eq!(runtime.calls().last().map(String::as_str), Some("remove"));
    }

    #[tokio::test]
    async fn clone_exit_codes_map_to_clone_errors() {
        let ws = tempfile::tempdir().unwrap();
        let (tx, _rx) = watch::channel(0);
        for code in [CLONE_FAILED_EXIT, CHECKOUT_FAILED_EXIT] {
            let runtime = Scripted::new(&["error: could not clone"], code);
            let result = executor(runtime, Duration::from_secs(5))
                .run(request(ws.path()), &CancellationToken::new(), &tx)
                .await;
            assert!(matches!(result.failure, Some(BuildError::Clone(_))));
        }

        let runtime = Scripted::new(&["error: timed out after 120s: git clone x"], STEP_TIMEOUT_EXIT);
        let result = executor(runtime, Duration::from_secs(5))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;
        match result.failure {
            Some(BuildError::Timeout { stage, limit }) => {
                assert_eq!(stage, "clone");
                assert_eq!(limit, Duration::from_secs(120));
            }
            other => panic!("unexpected {other:?}"),
        }

        let runtime = Scripted::new(&["error: timed out after 60s: git fetch origin abc"], SIGTERM_EXIT);
        let result = executor(runtime, Duration::from_secs(5))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;
        match result.failure {
            Some(BuildError::Timeout { stage, .. }) => assert_eq!(stage, "checkout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_kills_and_removes() {
        let ws = tempfile::tempdir().unwrap();
        let runtime = Scripted::hanging();
        let (tx, rx) = watch::channel(0);

        let result = executor(runtime.clone(), Duration::from_secs(600))
            .run(request(ws.path()), &CancellationToken::new(), &tx)
            .await;

        assert!(matches!(result.failure, Some(BuildError::Timeout { ref stage, .. }) if stage == "run"));
        assert_eq!(runtime.calls(), vec!["create", "kill", "remove"]);
        assert_eq!(*rx.borrow(), 10);
    }

    #[tokio::test]
    async fn cancellation_kills_and_removes() {
        let ws = tempfile::tempdir().unwrap();
        let runtime = Scripted::hanging();
        let (tx, _rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = executor(runtime.clone(), Duration::from_secs(30))
            .run(request(ws.path()), &cancel, &tx)
            .await;

        assert!(matches!(result.failure, Some(BuildError::Cancelled)));
        assert_eq!(runtime.calls(), vec!["create", "kill", "remove"]);
    }
}
