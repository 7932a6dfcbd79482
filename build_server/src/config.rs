//! Build engine configuration, loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::sandbox::{ImageCatalog, ResourceLimits};
use crate::services::scheduler::SchedulerConfig;
use crate::services::script_generator::StepLimits;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// PostgreSQL URL; `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// Maximum database connections in the pool.
    pub db_max_connections: usize,
    /// Worker pool size.
    pub concurrency: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub poll_interval_ms: u64,
    /// A claim not renewed for this long is considered abandoned.
    pub claim_lease_secs: u64,
    pub workspace_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Only local repositories under this directory may be mounted; unset
    /// rejects every local repository.
    pub mirror_root: Option<PathBuf>,
    pub run_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    pub checkout_timeout_secs: u64,
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub pids_limit: u64,
    /// Captured log lines kept per attempt.
    pub max_log_lines: usize,
    pub retention_days: i64,
    pub sweep_interval_secs: u64,
    pub docker_bin: String,
    /// Network attached to builds that need egress.
    pub build_network: String,
    /// Optional HTTP callback for deployment notifications.
    pub deploy_callback_url: Option<String>,
    pub metrics_addr: SocketAddr,
    /// Image overrides.
    pub static_image: String,
    pub node_image: Option<String>,
    pub python_image: Option<String>,
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{key}={raw} is not valid, using default");
            default
        }),
        Err(_) => default,
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            concurrency: 5,
            max_retries: 3,
            retry_base_ms: 2000,
            poll_interval_ms: 1000,
            claim_lease_secs: 60,
            workspace_dir: PathBuf::from("./data/workspaces"),
            artifact_dir: PathBuf::from("./data/artifacts"),
            cache_dir: PathBuf::from("./data/cache"),
            mirror_root: None,
            run_timeout_secs: 600,
            clone_timeout_secs: 120,
            checkout_timeout_secs: 60,
            memory_mb: 2048,
            cpu_shares: 512,
            pids_limit: 512,
            max_log_lines: 10_000,
            retention_days: 7,
            sweep_interval_secs: 3600,
            docker_bin: "docker".to_string(),
            build_network: "bridge".to_string(),
            deploy_callback_url: None,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            static_image: "nginx:alpine".to_string(),
            node_image: None,
            python_image: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let config = Self {
            database_url: optional("DATABASE_URL"),
            db_max_connections: parsed("SHIPYARD_DB_MAX_CONNECTIONS", d.db_max_connections),
            concurrency: parsed("SHIPYARD_CONCURRENCY", d.concurrency),
            max_retries: parsed("SHIPYARD_MAX_RETRIES", d.max_retries),
            retry_base_ms: parsed("SHIPYARD_RETRY_BASE_MS", d.retry_base_ms),
            poll_interval_ms: parsed("SHIPYARD_POLL_INTERVAL_MS", d.poll_interval_ms),
            claim_lease_secs: parsed("SHIPYARD_CLAIM_LEASE_SECS", d.claim_lease_secs),
            workspace_dir: optional("SHIPYARD_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.workspace_dir),
            artifact_dir: optional("SHIPYARD_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.artifact_dir),
            cache_dir: optional("SHIPYARD_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.cache_dir),
            mirror_root: optional("SHIPYARD_MIRROR_ROOT").map(PathBuf::from),
            run_timeout_secs: parsed("SHIPYARD_RUN_TIMEOUT_SECS", d.run_timeout_secs),
            clone_timeout_secs: parsed("SHIPYARD_CLONE_TIMEOUT_SECS", d.clone_timeout_secs),
            checkout_timeout_secs: parsed(
                "SHIPYARD_CHECKOUT_TIMEOUT_SECS",
                d.checkout_timeout_secs,
            ),
            memory_mb: parsed("SHIPYARD_MEMORY_MB", d.memory_mb),
            cpu_shares: parsed("SHIPYARD_CPU_SHARES", d.cpu_shares),
            pids_limit: parsed("SHIPYARD_PIDS_LIMIT", d.pids_limit),
            max_log_lines: parsed("SHIPYARD_MAX_LOG_LINES", d.max_log_lines),
            retention_days: parsed("SHIPYARD_RETENTION_DAYS", d.retention_days),
            sweep_interval_secs: parsed("SHIPYARD_SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            docker_bin: optional("SHIPYARD_DOCKER_BIN").unwrap_or(d.docker_bin),
            build_network: optional("SHIPYARD_BUILD_NETWORK").unwrap_or(d.build_network),
            deploy_callback_url: optional("SHIPYARD_DEPLOY_CALLBACK_URL"),
            metrics_addr: parsed("SHIPYARD_METRICS_ADDR", d.metrics_addr),
            static_image: optional("SHIPYARD_STATIC_IMAGE").unwrap_or(d.static_image),
            node_image: optional("SHIPYARD_NODE_IMAGE"),
            python_image: optional("SHIPYARD_PYTHON_IMAGE"),
        };

        if config.database_url.is_none() {
            tracing::warn!("DATABASE_URL not set -- using the in-memory store, queue will not survive restarts");
        }
        if config.deploy_callback_url.is_none() {
            tracing::info!("SHIPYARD_DEPLOY_CALLBACK_URL not set -- deployment callbacks disabled");
        }
        config
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency.max(1),
            max_retries: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            claim_lease: Duration::from_secs(self.claim_lease_secs.max(3)),
            step_limits: self.step_limits(),
        }
    }

    pub fn step_limits(&self) -> StepLimits {
        StepLimits {
            clone_secs: self.clone_timeout_secs,
            checkout_secs: self.checkout_timeout_secs,
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb,
            cpu_shares: self.cpu_shares,
            pids_limit: self.pids_limit,
        }
    }

    pub fn images(&self) -> ImageCatalog {
        ImageCatalog {
            static_image: self.static_image.clone(),
            node_image: self.node_image.clone(),
            python_image: self.python_image.clone(),
            ..ImageCatalog::default()
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn retention_horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.run_timeout(), Duration::from_secs(600));
        assert_eq!(config.resource_limits().memory_mb, 2048);
        assert_eq!(config.retention_horizon(), chrono::Duration::days(7));

        let scheduler = config.scheduler();
        assert_eq!(scheduler.retry_base, Duration::from_secs(2));
        assert_eq!(scheduler.step_limits, StepLimits::default());
        assert_eq!(scheduler.claim_lease, Duration::from_secs(60));
        assert_eq!(scheduler.heartbeat_interval(), Duration::from_secs(20));
        assert!(config.mirror_root.is_none());
    }
}
