//! Worker process: runs `similarity_match` jobs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairwise_core::{defaults, WorkflowTrigger};
use pairwise_db::{Database, PoolConfig};
use pairwise_dedup::{DedupService, FilesystemArtifactStore, HttpWorkflowTrigger, SimilarityMatchHandler};
use pairwise_jobs::{JobQueue, WorkerBuilder, WorkerConfig};
use pairwise_vision::VisionClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "pairwise=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "pairwise_dedup=info,pairwise_jobs=info,pairwise_db=info,pairwise_vision=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("pairwise-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = WorkerConfig::from_env();
    if !config.enabled {
        warn!("JOB_WORKER_ENABLED=false, nothing to do");
        return Ok(());
    }

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string());
    let pool_config = PoolConfig::from_env().with_capacity_for(config.workers);
    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;

    let queue = JobQueue::new(Arc::new(db.jobs.clone()))
        .with_retry_backoff(Duration::from_millis(config.retry_backoff_ms));

    let mut service = DedupService::from_database(&db, queue.clone());
    match HttpWorkflowTrigger::from_env()? {
        Some(trigger) => {
            let trigger: Arc<dyn WorkflowTrigger> = Arc::new(trigger);
            service = service.with_workflow_trigger(trigger);
        }
        None => info!("WORKFLOW_BASE_URL not set, workflow auto-trigger disabled"),
    }

    let matcher = VisionClient::from_env()?;
    let artifacts = FilesystemArtifactStore::from_env();
    info!(artifact_root = %artifacts.root().display(), "Artifact store ready");

    let monitor_secs = config.reap_interval_secs;
    let handler = SimilarityMatchHandler::new(service, Arc::new(matcher), Arc::new(artifacts));
    let worker = WorkerBuilder::new(queue)
        .with_config(config)
        .with_handler(handler)
        .build()
        .await;
    let handle = worker.start();

    let pool_monitor = (monitor_secs > 0).then(|| {
        let db = db.clone();
        let period = Duration::from_secs(monitor_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                db.pool_health();
            }
        })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining workers");
    if let Some(monitor) = pool_monitor {
        monitor.abort();
    }
    handle.shutdown().await?;
    info!("Worker stopped");
    Ok(())
}
