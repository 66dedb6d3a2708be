//! Job queue facade.
//!
//! [`JobQueue`] wraps a [`JobRepository`] with input validation, domain
//! events and a wake-up signal for idle workers. All cross-worker guarantees
//! (exclusive leases, dedupe convergence) come from the repository.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use pairwise_core::{
    defaults, DomainEvent, EnqueueOutcome, Error, EventBus, Job, JobFailure, JobFilter,
    JobRepository, JobStatus, NewJob, Outbox, QueueStats, RequestContext, Result, TaskPayload,
};

/// Shared handle to the job queue.
#[derive(Clone)]
pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    events: EventBus,
    wake: Arc<Notify>,
    retry_backoff: chrono::Duration,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            events: EventBus::default(),
            wake: Arc::new(Notify::new()),
            retry_backoff: backoff_from_millis(defaults::JOB_RETRY_BACKOFF_MS),
        }
    }

    /// Publish domain events on an existing bus.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Delay before a retryable failure becomes eligible again, capped at
    /// [`defaults::JOB_MAX_RETRY_BACKOFF_MS`].
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        let capped = backoff.min(Duration::from_millis(defaults::JOB_MAX_RETRY_BACKOFF_MS));
        self.retry_backoff = chrono::Duration::from_std(capped)
            .unwrap_or_else(|_| backoff_from_millis(defaults::JOB_RETRY_BACKOFF_MS));
        self
    }

    pub fn retry_backoff(&self) -> chrono::Duration {
        self.retry_backoff
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resolves when a job is enqueued or reclaimed.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    /// Enqueue a job, or promote the live job holding its dedupe key.
    #[instrument(skip(self, ctx, job), fields(subsystem = "jobs", component = "queue", op = "enqueue", task_type = %job.task_type, request_id = %ctx.request_id))]
    pub async fn enqueue(&self, ctx: &RequestContext, job: NewJob) -> Result<EnqueueOutcome> {
        let job = validate(job)?;
        let outcome = self.repo.enqueue(ctx, &job).await?;

        let mut outbox = Outbox::new();
        match (&job.dedupe_key, outcome.promoted) {
            (Some(key), true) => {
                debug!(job_id = %outcome.job_id, dedupe_key = %key, "Promoted existing job");
                outbox.push(DomainEvent::JobPromoted {
                    job_id: outcome.job_id,
                    dedupe_key: key.clone(),
                });
            }
            _ => {
                debug!(job_id = %outcome.job_id, "Job enqueued");
                outbox.push(DomainEvent::JobEnqueued {
                    job_id: outcome.job_id,
                    task_type: job.task_type.clone(),
                });
            }
        }
        outbox.flush(&self.events, ctx);
        self.wake.notify_waiters();
        Ok(outcome)
    }

    /// Enqueue a typed payload under its natural dedupe key.
    pub async fn enqueue_task(
        &self,
        ctx: &RequestContext,
        payload: &TaskPayload,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let job = NewJob::new(payload.task_type(), payload.to_json()?)
            .with_priority(priority)
            .with_dedupe_key(payload.dedupe_key());
        self.enqueue(ctx, job).await
    }

    pub async fn dequeue(&self, worker_id: &str, task_types: &[String]) -> Result<Option<Job>> {
        self.repo.dequeue(worker_id, task_types).await
    }

    /// Complete a job leased by `worker_id`.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        job_id: Uuid,
        worker_id: &str,
        result: Option<JsonValue>,
    ) -> Result<()> {
        self.repo.complete(job_id, worker_id, result).await?;
        self.events.emit(DomainEvent::JobCompleted { job_id }, ctx);
        Ok(())
    }

    /// Record a failure of a job leased by `worker_id`. Returns `pending`
    /// when the job will be retried.
    pub async fn fail(
        &self,
        ctx: &RequestContext,
        job_id: Uuid,
        worker_id: &str,
        failure: &JobFailure,
    ) -> Result<JobStatus> {
        let status = self
            .repo
            .fail(job_id, worker_id, failure, self.retry_backoff)
            .await?;
        let terminal = status == JobStatus::Failed;
        if terminal {
            warn!(%job_id, error = %failure.message, error_code = ?failure.code, "Job failed terminally");
        } else {
            debug!(%job_id, error = %failure.message, "Job scheduled for retry");
            self.wake.notify_waiters();
        }
        self.events.emit(
            DomainEvent::JobFailed {
                job_id,
                terminal,
                error: failure.message.clone(),
            },
            ctx,
        );
        Ok(status)
    }

    /// Return jobs leased before `cutoff` to pending.
    #[instrument(skip(self, ctx), fields(subsystem = "jobs", component = "reaper", op = "reclaim_stale"))]
    pub async fn reclaim_stale(&self, ctx: &RequestContext, cutoff: DateTime<Utc>) -> Result<u64> {
        let count = self.repo.reclaim_stale(cutoff).await?;
        if count > 0 {
            info!(rows = count, "Reclaimed stale jobs");
            self.events.emit(DomainEvent::JobsReclaimed { count }, ctx);
            self.wake.notify_waiters();
        }
        Ok(count)
    }

    /// Cancel a pending job. False when it is already leased or finished.
    pub async fn cancel(&self, ctx: &RequestContext, job_id: Uuid) -> Result<bool> {
        let cancelled = self.repo.cancel(job_id).await?;
        if cancelled {
            self.events.emit(DomainEvent::JobCancelled { job_id }, ctx);
        }
        Ok(cancelled)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.repo.get(job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.repo.list(filter).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.repo.stats().await
    }
}

fn validate(mut job: NewJob) -> Result<NewJob> {
    job.task_type = job.task_type.trim().to_string();
    if job.task_type.is_empty() {
        return Err(Error::InvalidInput("task_type is required".into()));
    }
    if job.max_attempts < 1 {
        return Err(Error::InvalidInput(format!(
            "max_attempts must be at least 1, got {}",
            job.max_attempts
        )));
    }
    if let Some(key) = job.dedupe_key.take() {
        let key = key.trim();
        job.dedupe_key = (!key.is_empty()).then(|| key.to_string());
    }
    Ok(job)
}

fn backoff_from_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
