//! Data models for jobs, similarity records, dedup rules and batches.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle status of a job.
///
/// `pending → processing → {completed, failed, pending (retry)}` and
/// `pending → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal jobs are retained as an audit trail and never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_type: String,
    /// Opaque to the queue; interpreted by the handler for `task_type`.
    pub payload: JsonValue,
    pub status: JobStatus,
    pub priority: i32,
    pub dedupe_key: Option<String>,
    /// Current or last lease holder.
    pub worker_id: Option<String>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    /// Retained across retries.
    pub last_error: Option<String>,
    pub error_code: Option<String>,
    pub tenant_id: Option<String>,
    pub org_id: Option<String>,
    pub created_by: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job may be leased at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether `worker_id` holds the current lease.
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Whether a further lease would exceed the attempt budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count > self.max_attempts
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_type: String,
    pub payload: JsonValue,
    pub priority: i32,
    pub dedupe_key: Option<String>,
    /// Not eligible before this instant; defaults to now.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(task_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: defaults::JOB_PRIORITY,
            dedupe_key: None,
            scheduled_at: None,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: Uuid,
    /// True when an existing live job under the same dedupe key absorbed the
    /// request instead of a new row being inserted.
    pub promoted: bool,
}

/// Failure report for a leased job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
    pub code: Option<String>,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Non-retryable: the job goes straight to `failed`.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Classify an error by its declared retry class.
    pub fn from_error(err: &crate::Error) -> Self {
        let failure = if err.is_retryable() {
            Self::retryable(err.to_string())
        } else {
            Self::fatal(err.to_string())
        };
        let code = if err.is_retryable() { "job_failed" } else { "fatal" };
        failure.with_code(code)
    }
}

/// Filters for listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub task_type: Option<String>,
    pub dedupe_key: Option<String>,
    /// Matches `payload.batch_id`.
    pub batch_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

// =============================================================================
// SIMILARITY RECORDS
// =============================================================================

/// Review status of a candidate duplicate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityStatus {
    PendingReview,
    Confirmed,
    Rejected,
}

impl SimilarityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SimilarityStatus::PendingReview => "pending_review",
            SimilarityStatus::Confirmed => "confirmed",
            SimilarityStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_review" => Some(SimilarityStatus::PendingReview),
            "confirmed" => Some(SimilarityStatus::Confirmed),
            "rejected" => Some(SimilarityStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for SimilarityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted candidate duplicate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRecord {
    pub id: Uuid,
    pub source_file_id: String,
    pub target_file_id: String,
    /// Unique, order-independent key of the pair.
    pub pair_key: String,
    pub score: f64,
    pub status: SimilarityStatus,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub detection_mode: Option<String>,
    pub detection_params: JsonValue,
    pub reviewed_by: Option<String>,
    pub review_note: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub workflow_process_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A candidate pair produced by the matcher, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub source_file_id: String,
    pub target_file_id: String,
    pub score: f64,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub mode: Option<String>,
    #[serde(default)]
    pub params: JsonValue,
}

impl CandidatePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>, score: f64) -> Self {
        Self {
            source_file_id: source.into(),
            target_file_id: target.into(),
            score,
            rule_id: None,
            batch_id: None,
            mode: None,
            params: JsonValue::Null,
        }
    }

    pub fn with_rule(mut self, rule_id: Option<Uuid>) -> Self {
        self.rule_id = rule_id;
        self
    }

    pub fn with_batch(mut self, batch_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Canonical key for this pair.
    pub fn pair_key(&self) -> String {
        crate::pair_key(&self.source_file_id, &self.target_file_id)
    }

    /// A file can never be a duplicate of itself.
    pub fn is_self_pair(&self) -> bool {
        self.source_file_id.trim() == self.target_file_id.trim()
    }

    /// Build the row to insert.
    pub fn into_record(self, now: DateTime<Utc>) -> SimilarityRecord {
        SimilarityRecord {
            id: Uuid::now_v7(),
            pair_key: self.pair_key(),
            source_file_id: self.source_file_id.trim().to_string(),
            target_file_id: self.target_file_id.trim().to_string(),
            score: self.score,
            status: SimilarityStatus::PendingReview,
            rule_id: self.rule_id,
            batch_id: self.batch_id,
            detection_mode: self.mode,
            detection_params: self.params,
            reviewed_by: None,
            review_note: None,
            reviewed_at: None,
            workflow_process_id: None,
            created_at: now,
        }
    }
}

/// Outcome of ingesting a set of candidate pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// New records inserted by this call.
    pub created: usize,
    /// Pairs already present (or inserted concurrently by another caller).
    pub existing: usize,
    /// Self-pairs and empty identifiers.
    pub skipped: usize,
}

/// Reviewer decision on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Confirmed,
    Rejected,
}

impl ReviewDecision {
    pub fn status(self) -> SimilarityStatus {
        match self {
            ReviewDecision::Confirmed => SimilarityStatus::Confirmed,
            ReviewDecision::Rejected => SimilarityStatus::Rejected,
        }
    }
}

/// Review metadata written by a review action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewUpdate {
    pub status: SimilarityStatus,
    pub reviewed_by: Option<String>,
    pub note: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

/// Filters shared by report and export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Window length when `start_date` is absent.
    pub days: Option<i64>,
    pub status: Option<SimilarityStatus>,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

/// A filter with its time window fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecordFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: i64,
    pub status: Option<SimilarityStatus>,
    pub rule_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

impl RecordFilter {
    /// Resolve the window against `now`.
    ///
    /// `end` defaults to `now`, `start` to `end - days`. Returns `None` when
    /// the window is inverted.
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<ResolvedRecordFilter> {
        let days = self.days.unwrap_or(defaults::REPORT_WINDOW_DAYS).max(0);
        let end = self.end_date.unwrap_or(now);
        let start = self.start_date.unwrap_or(end - Duration::days(days));
        if start > end {
            return None;
        }
        Some(ResolvedRecordFilter {
            start,
            end,
            days,
            status: self.status,
            rule_id: self.rule_id,
            batch_id: self.batch_id,
        })
    }
}

impl ResolvedRecordFilter {
    pub fn matches(&self, record: &SimilarityRecord) -> bool {
        record.created_at >= self.start
            && record.created_at <= self.end
            && self.status.map_or(true, |s| record.status == s)
            && self.rule_id.map_or(true, |r| record.rule_id == Some(r))
            && self.batch_id.map_or(true, |b| record.batch_id == Some(b))
    }
}

/// Ordering of record listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrder {
    /// `created_at ASC, id ASC`. Stable; used for export.
    Oldest,
    /// `created_at DESC, id DESC`. Used for "latest" listings.
    Newest,
}

/// Per-day breakdown entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    /// `YYYY-MM-DD` (UTC).
    pub day: String,
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
}

/// Aggregated counts over a filtered record set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_rule_id: BTreeMap<String, i64>,
    pub by_batch_id: BTreeMap<String, i64>,
    pub no_batch: i64,
    /// Ascending by day.
    pub by_day: Vec<DayCount>,
}

// =============================================================================
// DEDUP RULES
// =============================================================================

/// Matching configuration for a scope of files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Scope: rule applies to files of items of this type.
    pub item_type: Option<String>,
    /// Scope: rule applies to files of this document type ("all" = any).
    pub document_type: Option<String>,
    /// Minimum combined score.
    pub threshold: f64,
    pub phash_threshold: i32,
    pub feature_threshold: f64,
    /// Match mode in the legacy vocabulary.
    pub mode: String,
    pub auto_trigger_workflow: bool,
    pub workflow_map_id: Option<String>,
    /// Lower sorts first when resolving the applicable rule.
    pub priority: i32,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Rule creation payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub description: Option<String>,
    pub item_type: Option<String>,
    pub document_type: Option<String>,
    pub threshold: Option<f64>,
    pub phash_threshold: Option<i32>,
    pub feature_threshold: Option<f64>,
    pub mode: Option<String>,
    #[serde(default)]
    pub auto_trigger_workflow: bool,
    pub workflow_map_id: Option<String>,
    pub priority: Option<i32>,
}

/// Partial rule update. `None` leaves a field unchanged; for
/// `workflow_map_id`, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub item_type: Option<String>,
    pub document_type: Option<String>,
    pub threshold: Option<f64>,
    pub phash_threshold: Option<i32>,
    pub feature_threshold: Option<f64>,
    pub mode: Option<String>,
    pub auto_trigger_workflow: Option<bool>,
    #[serde(default, with = "double_option")]
    pub workflow_map_id: Option<Option<String>>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

// =============================================================================
// DEDUP BATCHES
// =============================================================================

/// Lifecycle status of a dedup batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BatchStatus::Queued),
            "running" => Some(BatchStatus::Running),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Selection of files a batch runs over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchScope {
    #[default]
    All,
    FileList { file_ids: Vec<String> },
    ItemType { item_type: String },
    DocumentType { document_type: String },
}

/// A bounded dedup run over a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupBatch {
    pub id: Uuid,
    pub name: Option<String>,
    pub scope: BatchScope,
    pub rule_id: Option<Uuid>,
    pub status: BatchStatus,
    pub jobs_spawned: i32,
    pub total_files: i32,
    pub processed_files: i32,
    pub found_similarities: i64,
    pub summary: JsonValue,
    pub error_message: Option<String>,
    pub created_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Batch creation payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub name: Option<String>,
    #[serde(default)]
    pub scope: BatchScope,
    pub rule_id: Option<Uuid>,
}

// =============================================================================
// PORT PAYLOADS
// =============================================================================

/// Source artifact fetched for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub document_type: Option<String>,
}

/// A file registered in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFile {
    pub file_id: String,
    pub filename: String,
    pub item_type: Option<String>,
    pub document_type: Option<String>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Wire version that produced a search response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    V1,
    V2,
}

/// A similarity search request in the legacy mode vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    pub filename: String,
    pub bytes: Vec<u8>,
    /// Legacy mode name (`fast`, `balanced`, `accurate`, ...).
    pub mode: String,
    pub phash_threshold: i32,
    pub feature_threshold: f64,
    pub max_results: u32,
    pub exclude_self: bool,
}

/// Raw search response with the version that answered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResponse {
    pub version: WireVersion,
    pub body: JsonValue,
}

/// Request to start a workflow for a confirmed duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStartRequest {
    pub workflow_map_id: String,
    pub record_id: Uuid,
    pub source_file_id: String,
    pub target_file_id: String,
}
