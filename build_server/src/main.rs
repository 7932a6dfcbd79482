//! Shipyard build daemon.
//!
//! Claims queued builds from the job table, runs each attempt in a sandboxed
//! container and records the outcome. `submit` queues a build request from a
//! JSON file into the same (PostgreSQL) job table and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use shipyard_build_server::config::EngineConfig;
use shipyard_build_server::metrics;
use shipyard_build_server::migration;
use shipyard_build_server::models::BuildRequest;
use shipyard_build_server::services::artifact_service::ArtifactPackager;
use shipyard_build_server::services::cache_service::CacheManager;
use shipyard_build_server::services::deployment_service::{
    HttpDeploymentNotifier, NotifierSet, StoreDeploymentNotifier,
};
use shipyard_build_server::services::executor::Executor;
use shipyard_build_server::services::pipeline::BuildPipeline;
use shipyard_build_server::services::retention::RetentionSweeper;
use shipyard_build_server::services::sandbox::DockerCli;
use shipyard_build_server::services::scheduler::Scheduler;
use shipyard_build_server::services::tracker::BuildTracker;
use shipyard_build_server::store::{BuildStore, DeploymentStore, JobQueue, MemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "shipyard-build", about = "Shipyard source-to-artifact build engine")]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Concurrent build workers
    #[arg(short, long, env = "SHIPYARD_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Prometheus exporter listen address
    #[arg(long, env = "SHIPYARD_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Container CLI binary
    #[arg(long, env = "SHIPYARD_DOCKER_BIN")]
    docker_bin: Option<String>,

    /// Seconds to wait for running builds on shutdown
    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool (default)
    Serve,
    /// Queue a build request read from a JSON file and print the queued build
    Submit {
        #[arg(long)]
        request: PathBuf,
    },
}

struct Stores {
    builds: Arc<dyn BuildStore>,
    queue: Arc<dyn JobQueue>,
    deployments: Arc<dyn DeploymentStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(addr) = cli.metrics_addr {
        config.metrics_addr = addr;
    }
    if let Some(bin) = cli.docker_bin.clone() {
        config.docker_bin = bin;
    }

    let stores = open_stores(&config).await?;
    let scheduler = build_scheduler(&config, &stores)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Submit { request } => {
            if config.database_url.is_none() {
                anyhow::bail!("submit needs DATABASE_URL: the in-memory queue is private to this process");
            }
            let raw = tokio::fs::read_to_string(&request).await?;
            let request: BuildRequest = serde_json::from_str(&raw)?;
            let queued = scheduler.enqueue(request).await?;
            let grace = Duration::from_secs(cli.shutdown_grace_secs);
            if tokio::time::timeout(grace, scheduler.flush_notifications()).await.is_err() {
                tracing::warn!("Deployment notification still pending at exit");
            }
            println!("{}", serde_json::to_string_pretty(&queued)?);
            Ok(())
        }
        Command::Serve => serve(config, stores, scheduler, Duration::from_secs(cli.shutdown_grace_secs)).await,
    }
}

async fn serve(
    config: EngineConfig,
    stores: Stores,
    scheduler: Scheduler,
    grace: Duration,
) -> anyhow::Result<()> {
    tracing::info!("Starting Shipyard build engine...");

    // Only claims whose worker stopped renewing them are taken back; builds
    // running in another live process keep their claim.
    scheduler.requeue_expired().await?;

    // Initialize metrics
    metrics::init_metrics(config.metrics_addr);

    scheduler.start();

    let background = CancellationToken::new();
    let sweeper = RetentionSweeper::new(
        stores.builds.clone(),
        stores.queue.clone(),
        ArtifactPackager::new(&config.artifact_dir),
        config.retention_horizon(),
    );
    let sweep_task = tokio::spawn(sweeper.run(
        Duration::from_secs(config.sweep_interval_secs.max(1)),
        background.clone(),
    ));

    shutdown_signal().await;

    background.cancel();
    scheduler.shutdown(grace).await;
    if tokio::time::timeout(grace, scheduler.flush_notifications()).await.is_err() {
        tracing::warn!("Deployment notifications still pending at shutdown");
    }
    let _ = sweep_task.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn open_stores(config: &EngineConfig) -> anyhow::Result<Stores> {
    let Some(url) = config.database_url.as_deref() else {
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            builds: store.clone(),
            queue: store.clone(),
            deployments: store,
        });
    };

    let store = PgStore::connect(url, config.db_max_connections)?;

    // Run build engine migration (creates builds, build_jobs, deployments)
    {
        let mut conn = store
            .pool()
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        tracing::info!("Running build engine migration...");
        migration::run_migration(&mut conn).await?;
        tracing::info!("Build engine migration completed.");
    }

    let store = Arc::new(store);
    Ok(Stores {
        builds: store.clone(),
        queue: store.clone(),
        deployments: store,
    })
}

fn build_scheduler(config: &EngineConfig, stores: &Stores) -> anyhow::Result<Scheduler> {
    let mut notifiers =
        NotifierSet::new().with(Arc::new(StoreDeploymentNotifier::new(stores.deployments.clone())));
    if let Some(url) = config.deploy_callback_url.as_deref() {
        notifiers = notifiers.with(Arc::new(HttpDeploymentNotifier::new(url)?));
    }
    let tracker = BuildTracker::new(stores.builds.clone(), Arc::new(notifiers));

    let executor = Executor::new(
        Arc::new(DockerCli::new(config.docker_bin.clone())),
        config.run_timeout(),
        config.step_limits(),
        config.max_log_lines,
    );
    let pipeline = BuildPipeline {
        executor,
        cache: CacheManager::new(&config.cache_dir),
        packager: ArtifactPackager::new(&config.artifact_dir),
        images: config.images(),
        limits: config.resource_limits(),
        step_limits: config.step_limits(),
        workspace_root: config.workspace_dir.clone(),
        build_network: config.build_network.clone(),
        mirror_root: config.mirror_root.clone(),
    };

    Ok(Scheduler::new(
        stores.builds.clone(),
        stores.queue.clone(),
        tracker,
        pipeline,
        config.scheduler(),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
