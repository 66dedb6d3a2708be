//! Job handler trait and execution context.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use pairwise_core::{Error, Job, JobFailure, RequestContext, Result, TaskPayload};

/// Context provided to job handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job being processed, as re-read right before dispatch.
    pub job: Job,
    /// Identity the job was enqueued under, with a fresh request id.
    pub ctx: RequestContext,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        let ctx = RequestContext::from_job(&job);
        Self { job, ctx }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Decode the payload for this job's task type.
    pub fn decode(&self) -> Result<TaskPayload> {
        TaskPayload::decode(&self.job.task_type, &self.job.payload)
    }

    /// 1-based attempt number of this execution.
    pub fn attempt(&self) -> i32 {
        self.job.attempt_count
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Permanent failure; the job is not retried.
    Failed(String),
    /// Transient failure; retried while attempts remain.
    Retry(String),
}

impl JobResult {
    /// Classify an error by its declared retry class.
    pub fn from_error(err: Error) -> Self {
        if err.is_retryable() {
            JobResult::Retry(err.to_string())
        } else {
            JobResult::Failed(err.to_string())
        }
    }

    /// Split into the completion result or the failure reported to the queue.
    pub fn into_outcome(self) -> std::result::Result<Option<JsonValue>, JobFailure> {
        match self {
            JobResult::Success(value) => Ok(value),
            JobResult::Failed(msg) => Err(JobFailure::fatal(msg).with_code("fatal")),
            JobResult::Retry(msg) => Err(JobFailure::retryable(msg).with_code("job_failed")),
        }
    }
}

impl From<Result<Option<JsonValue>>> for JobResult {
    fn from(result: Result<Option<JsonValue>>) -> Self {
        match result {
            Ok(value) => JobResult::Success(value),
            Err(e) => JobResult::from_error(e),
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The task type this handler processes.
    fn task_type(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    fn can_handle(&self, task_type: &str) -> bool {
        self.task_type() == task_type
    }
}

/// Handler that completes every job without doing anything.
pub struct NoOpHandler {
    task_type: String,
}

impl NoOpHandler {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success(None)
    }
}
