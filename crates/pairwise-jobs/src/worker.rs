//! Worker pool that leases jobs from the queue and dispatches them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use pairwise_core::{defaults, Error, Job, JobFailure, JobStatus, RequestContext, Result};

use crate::handler::{JobContext, JobHandler};
use crate::queue::JobQueue;

/// Ten years; keeps the reaper cutoff representable.
const MAX_STALE_AFTER_SECS: u64 = 10 * 365 * 24 * 3600;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix of every executor's worker id (`<pool_name>-<index>`).
    pub pool_name: String,
    /// Number of concurrent executors.
    pub workers: usize,
    /// Idle back-off between polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Upper bound on one handler execution.
    pub job_timeout_secs: u64,
    /// Processing jobs older than this are reclaimed.
    pub stale_after_secs: u64,
    /// Reaper period. Zero disables the reaper.
    pub reap_interval_secs: u64,
    /// Delay before a retried job is eligible again.
    pub retry_backoff_ms: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_name: "worker".to_string(),
            workers: defaults::JOB_WORKERS,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            stale_after_secs: defaults::JOB_STALE_AFTER_SECS,
            reap_interval_secs: defaults::JOB_REAP_INTERVAL_SECS,
            retry_backoff_ms: defaults::JOB_RETRY_BACKOFF_MS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POOL_NAME` | `worker` | Worker id prefix |
    /// | `JOB_WORKERS` | `4` | Concurrent executors |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Handler timeout |
    /// | `JOB_STALE_AFTER_SECS` | `900` | Lease age before reclaim |
    /// | `JOB_REAP_INTERVAL_SECS` | `60` | Reaper period, `0` disables |
    /// | `JOB_RETRY_BACKOFF_MS` | `0` | Delay before a retry is eligible |
    ///
    /// A stale window that does not exceed the handler timeout would let
    /// the reaper reclaim jobs whose handler is still running; it is raised
    /// to `job_timeout_secs + 1` with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let pool_name = std::env::var("JOB_POOL_NAME")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.pool_name);

        Self {
            pool_name,
            workers: env_parse("JOB_WORKERS", defaults.workers).max(1),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS", defaults.job_timeout_secs).max(1),
            stale_after_secs: env_parse("JOB_STALE_AFTER_SECS", defaults.stale_after_secs),
            reap_interval_secs: env_parse("JOB_REAP_INTERVAL_SECS", defaults.reap_interval_secs),
            retry_backoff_ms: env_parse("JOB_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
            enabled,
        }
        .with_safe_stale_window()
    }

    /// Raise `stale_after_secs` above `job_timeout_secs` when it is not.
    pub fn with_safe_stale_window(mut self) -> Self {
        if self.stale_after_secs <= self.job_timeout_secs {
            let raised = self.job_timeout_secs.saturating_add(1);
            warn!(
                subsystem = "jobs",
                stale_after_secs = self.stale_after_secs,
                job_timeout_secs = self.job_timeout_secs,
                raised,
                "Stale window must exceed the job timeout, raising it"
            );
            self.stale_after_secs = raised;
        }
        self
    }

    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_stale_after(mut self, secs: u64) -> Self {
        self.stale_after_secs = secs;
        self
    }

    pub fn with_reap_interval(mut self, secs: u64) -> Self {
        self.reap_interval_secs = secs;
        self
    }

    pub fn with_retry_backoff(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn worker_id(&self, index: usize) -> String {
        format!("{}-{}", self.pool_name, index)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Event emitted by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        task_type: String,
        worker_id: String,
    },
    JobCompleted {
        job_id: Uuid,
        task_type: String,
    },
    JobFailed {
        job_id: Uuid,
        task_type: String,
        error: String,
        /// False when the job went back to pending for another attempt.
        terminal: bool,
    },
    JobsReclaimed {
        count: u64,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop leasing new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        for task in self.tasks {
            task.await
                .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Pool of executors bound to one [`JobQueue`].
#[derive(Clone)]
pub struct JobWorker {
    queue: JobQueue,
    config: WorkerConfig,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(queue: JobQueue, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let queue = queue.with_retry_backoff(Duration::from_millis(config.retry_backoff_ms));
        Self {
            queue,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for its task type, replacing any previous one.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        self.register_arc(Arc::new(handler)).await;
    }

    async fn register_arc(&self, handler: Arc<dyn JobHandler>) {
        let task_type = handler.task_type().to_string();
        debug!(%task_type, "Registered job handler");
        self.handlers.write().await.insert(task_type, handler);
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the executors and the reaper and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_rx = self.event_tx.subscribe();
        let mut tasks = Vec::new();

        if !self.config.enabled {
            info!(subsystem = "jobs", "Job worker is disabled, not starting");
        } else {
            info!(
                subsystem = "jobs",
                pool = %self.config.pool_name,
                workers = self.config.workers,
                poll_interval_ms = self.config.poll_interval_ms,
                "Job worker pool started"
            );
            let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

            for index in 0..self.config.workers.max(1) {
                let worker = self.clone();
                let worker_id = self.config.worker_id(index);
                let shutdown = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    worker.run_executor(worker_id, shutdown).await;
                }));
            }

            if self.config.reap_interval_secs > 0 {
                let worker = self.clone();
                let shutdown = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    worker.run_reaper(shutdown).await;
                }));
            }
        }

        let stopper = self.clone();
        let mut shutdown = shutdown_rx;
        let executors = std::mem::take(&mut tasks);
        tasks.push(tokio::spawn(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            for task in executors {
                if let Err(e) = task.await {
                    error!(error = ?e, "Worker task panicked");
                }
            }
            if stopper.config.enabled {
                let _ = stopper.event_tx.send(WorkerEvent::WorkerStopped);
                info!(subsystem = "jobs", "Job worker pool stopped");
            }
        }));

        WorkerHandle {
            shutdown_tx,
            event_rx,
            tasks,
        }
    }

    async fn run_executor(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        debug!(%worker_id, "Executor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once(&worker_id).await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(%worker_id, error = %e, "Failed to lease job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.queue.notified() => {}
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        debug!(%worker_id, "Executor stopped");
    }

    async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.reap_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval) => {}
            }
            if let Err(e) = self.reap_once().await {
                error!(error = %e, "Failed to reclaim stale jobs");
            }
        }
    }

    /// Reclaim jobs whose lease is older than `stale_after_secs`.
    pub async fn reap_once(&self) -> Result<u64> {
        let stale_after =
            chrono::Duration::seconds(self.config.stale_after_secs.min(MAX_STALE_AFTER_SECS) as i64);
        let cutoff = Utc::now() - stale_after;
        let count = self
            .queue
            .reclaim_stale(&RequestContext::system(), cutoff)
            .await?;
        if count > 0 {
            let _ = self.event_tx.send(WorkerEvent::JobsReclaimed { count });
        }
        Ok(count)
    }

    /// Lease and execute one job. Returns false when nothing was eligible.
    pub async fn run_once(&self, worker_id: &str) -> Result<bool> {
        let task_types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        if task_types.is_empty() {
            return Ok(false);
        }
        match self.queue.dequeue(worker_id, &task_types).await? {
            Some(job) => {
                self.execute_job(worker_id, job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute a leased job and report its outcome to the queue.
    ///
    /// The job is re-read first so promotions that landed after the lease
    /// are visible to the handler.
    #[instrument(skip(self, leased), fields(subsystem = "jobs", component = "worker", job_id = %leased.id, task_type = %leased.task_type))]
    pub async fn execute_job(&self, worker_id: &str, leased: Job) {
        let start = Instant::now();
        let job_id = leased.id;
        let task_type = leased.task_type.clone();

        let job = match self.queue.get(job_id).await {
            Ok(Some(job)) if job.is_leased_by(worker_id) => job,
            Ok(Some(job)) => {
                warn!(
                    status = %job.status,
                    holder = ?job.worker_id,
                    "Lease lost before dispatch, skipping"
                );
                return;
            }
            Ok(None) => {
                warn!("Leased job disappeared before dispatch");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to re-read leased job, using leased copy");
                leased
            }
        };

        info!(attempt = job.attempt_count, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            task_type: task_type.clone(),
            worker_id: worker_id.to_string(),
        });

        let ctx = JobContext::new(job);
        let request_ctx = ctx.ctx.clone();

        let outcome = if ctx.job.attempts_exhausted() {
            Err(JobFailure::fatal(format!(
                "attempt budget exhausted: lease {} of {}",
                ctx.job.attempt_count, ctx.job.max_attempts
            ))
            .with_code("attempts_exhausted"))
        } else {
            self.dispatch(ctx).await
        };

        match outcome {
            Ok(result) => match self.queue.complete(&request_ctx, job_id, worker_id, result).await {
                Ok(()) => {
                    info!(
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job completed successfully"
                    );
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, task_type });
                }
                Err(e) => error!(error = %e, "Failed to mark job as completed"),
            },
            Err(failure) => match self.queue.fail(&request_ctx, job_id, worker_id, &failure).await {
                Ok(status) => {
                    warn!(
                        error = %failure.message,
                        error_code = ?failure.code,
                        %status,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job failed"
                    );
                    let _ = self.event_tx.send(WorkerEvent::JobFailed {
                        job_id,
                        task_type,
                        error: failure.message,
                        terminal: status == JobStatus::Failed,
                    });
                }
                Err(e) => error!(error = %e, "Failed to mark job as failed"),
            },
        }
    }

    /// Run the handler in its own task, bounded by the job timeout.
    async fn dispatch(
        &self,
        ctx: JobContext,
    ) -> std::result::Result<Option<serde_json::Value>, JobFailure> {
        let handler = self.handlers.read().await.get(&ctx.job.task_type).cloned();
        let Some(handler) = handler else {
            return Err(JobFailure::fatal(format!(
                "No handler for task type: {}",
                ctx.job.task_type
            ))
            .with_code("handler_missing"));
        };

        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let mut task = tokio::spawn(async move { handler.execute(ctx).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result.into_outcome(),
            Ok(Err(e)) if e.is_panic() => {
                Err(JobFailure::retryable("Job handler panicked").with_code("panic"))
            }
            Ok(Err(e)) => {
                Err(JobFailure::retryable(format!("Job handler aborted: {}", e)).with_code("panic"))
            }
            Err(_) => {
                task.abort();
                Err(JobFailure::retryable(format!(
                    "Job exceeded timeout of {}s",
                    self.config.job_timeout_secs
                ))
                .with_code("timeout"))
            }
        }
    }
}

/// Builder for creating a worker pool with handlers.
pub struct WorkerBuilder {
    queue: JobQueue,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.queue, self.config);
        for handler in self.handlers {
            worker.register_arc(handler).await;
        }
        worker
    }
}
