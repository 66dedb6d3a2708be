//! Ports implemented by the storage, matcher and workflow adapters.
//!
//! Every cross-worker guarantee lives behind these traits: implementations
//! must make `dequeue`, `fail`, `reclaim_stale` and
//! [`SimilarityRepository::insert_if_absent`] atomic in the store itself.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable job store.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job, or promote the live job holding the same dedupe key.
    async fn enqueue(&self, ctx: &RequestContext, job: &NewJob) -> Result<EnqueueOutcome>;

    /// Lease the next eligible job.
    ///
    /// Eligible means `pending` with `scheduled_at <= now`; selection order
    /// is `priority DESC, scheduled_at ASC, created_at ASC, id ASC`. An empty
    /// `task_types` slice leases any type.
    async fn dequeue(&self, worker_id: &str, task_types: &[String]) -> Result<Option<Job>>;

    /// `processing → completed`. A result is stored under `payload.result`.
    ///
    /// Only the worker holding the lease may complete the job; a worker
    /// whose lease was reclaimed gets an error and the row is untouched.
    async fn complete(&self, job_id: Uuid, worker_id: &str, result: Option<JsonValue>)
        -> Result<()>;

    /// `processing → pending` when retryable with attempts remaining,
    /// otherwise `processing → failed`. Returns the resulting status.
    ///
    /// Guarded by the lease holder like [`JobRepository::complete`].
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: &JobFailure,
        retry_delay: Duration,
    ) -> Result<JobStatus>;

    /// Return abandoned `processing` jobs started before `cutoff` to
    /// `pending`, preserving `attempt_count`.
    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// `pending → cancelled`. False when the job is not pending.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// DEDUP STORE
// =============================================================================

/// Similarity record storage keyed by unique `pair_key`.
#[async_trait]
pub trait SimilarityRepository: Send + Sync {
    /// Insert unless a record with the same `pair_key` exists.
    ///
    /// Returns `true` if this call created the row. Concurrent callers with
    /// the same pair converge to exactly one row without an error.
    async fn insert_if_absent(&self, record: &SimilarityRecord) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<SimilarityRecord>>;

    async fn get_by_pair_key(&self, pair_key: &str) -> Result<Option<SimilarityRecord>>;

    /// Write review metadata and return the updated record.
    async fn apply_review(&self, id: Uuid, update: &ReviewUpdate)
        -> Result<Option<SimilarityRecord>>;

    /// Set `workflow_process_id` to `next` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    ///
    /// Swapping from `None` is how exactly one caller claims the right to
    /// start a record's workflow.
    async fn swap_workflow_process(
        &self,
        id: Uuid,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool>;

    async fn list(
        &self,
        filter: &ResolvedRecordFilter,
        order: RecordOrder,
        limit: usize,
    ) -> Result<Vec<SimilarityRecord>>;

    async fn summarize(&self, filter: &ResolvedRecordFilter) -> Result<RecordSummary>;

    async fn count_for_batch(&self, batch_id: Uuid) -> Result<i64>;
}

/// Dedup rule storage. Names are unique.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn insert(&self, rule: &DedupRule) -> Result<()>;

    async fn update(&self, rule: &DedupRule) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DedupRule>>;

    /// Ordered `priority ASC, created_at ASC`.
    async fn list(&self, active_only: bool) -> Result<Vec<DedupRule>>;
}

/// Dedup batch storage.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn insert(&self, batch: &DedupBatch) -> Result<()>;

    async fn update(&self, batch: &DedupBatch) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DedupBatch>>;

    /// Newest first.
    async fn list(&self, limit: i64) -> Result<Vec<DedupBatch>>;
}

// =============================================================================
// COLLABORATOR PORTS
// =============================================================================

/// Read access to the files a batch can run over.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Files in `scope`, ordered by `file_id`, capped at `limit`.
    async fn list_files(&self, scope: &BatchScope, limit: Option<usize>) -> Result<Vec<CatalogFile>>;

    async fn get_file(&self, file_id: &str) -> Result<Option<CatalogFile>>;

    /// Resolve a checksum reported by the matcher to a known file id.
    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<String>>;
}

/// Source bytes of catalog files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Missing content is a fatal error.
    async fn fetch(&self, file: &CatalogFile) -> Result<Artifact>;
}

/// External similarity capability.
#[async_trait]
pub trait SimilarityMatcher: Send + Sync {
    async fn search(&self, ctx: &RequestContext, query: &MatchQuery) -> Result<MatchResponse>;

    /// Add an artifact to the search index.
    async fn index_add(
        &self,
        ctx: &RequestContext,
        artifact: &Artifact,
        user_name: Option<&str>,
    ) -> Result<JsonValue>;

    async fn health(&self, ctx: &RequestContext) -> Result<JsonValue>;
}

/// External workflow engine.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    /// Start a workflow instance and return its process id.
    async fn start(&self, ctx: &RequestContext, request: &WorkflowStartRequest) -> Result<String>;
}
