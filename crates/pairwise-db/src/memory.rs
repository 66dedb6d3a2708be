//! In-process store implementing every repository trait.
//!
//! Used by unit tests and by embedders that run without Postgres. Each
//! repository holds its state behind one `tokio::sync::Mutex`, so every
//! trait call is atomic with respect to the others, which gives the same
//! observable transitions as the conditional statements in the Postgres
//! repositories.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use pairwise_core::{
    promote_payload, BatchRepository, BatchScope, CatalogFile, DayCount, DedupBatch, DedupRule,
    EnqueueOutcome, Error, FileCatalog, Job, JobFailure, JobFilter, JobRepository, JobStatus,
    NewJob, QueueStats, RecordOrder, RecordSummary, RequestContext, ResolvedRecordFilter, Result,
    ReviewUpdate, RuleRepository, SimilarityRecord, SimilarityRepository,
};

use crate::catalog::ANY_DOCUMENT_TYPE;
use crate::jobs::lease_error;

// =============================================================================
// JOBS
// =============================================================================

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<BTreeMap<Uuid, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition_error(
        jobs: &BTreeMap<Uuid, Job>,
        job_id: Uuid,
        worker_id: &str,
        op: &str,
    ) -> Error {
        match jobs.get(&job_id) {
            Some(job) => lease_error(job, worker_id, op),
            None => Error::JobNotFound(job_id),
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, ctx: &RequestContext, new_job: &NewJob) -> Result<EnqueueOutcome> {
        let mut jobs = self.jobs.lock().await;

        if let Some(key) = new_job.dedupe_key.as_deref() {
            let live = jobs.values_mut().find(|j| {
                j.dedupe_key.as_deref() == Some(key) && !j.status.is_terminal()
            });
            if let Some(existing) = live {
                if let Some(merged) = promote_payload(&existing.payload, &new_job.payload) {
                    existing.payload = merged;
                }
                if existing.status == JobStatus::Pending {
                    existing.priority = existing.priority.max(new_job.priority);
                }
                return Ok(EnqueueOutcome {
                    job_id: existing.id,
                    promoted: true,
                });
            }
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            task_type: new_job.task_type.clone(),
            payload: new_job.payload.clone(),
            status: JobStatus::Pending,
            priority: new_job.priority,
            dedupe_key: new_job.dedupe_key.clone(),
            worker_id: None,
            attempt_count: 0,
            max_attempts: new_job.max_attempts,
            last_error: None,
            error_code: None,
            tenant_id: ctx.tenant_id.clone(),
            org_id: ctx.org_id.clone(),
            created_by: ctx.user_id.clone(),
            scheduled_at: new_job.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            created_at: now,
        };
        let job_id = job.id;
        jobs.insert(job_id, job);
        Ok(EnqueueOutcome {
            job_id,
            promoted: false,
        })
    }

    async fn dequeue(&self, worker_id: &str, task_types: &[String]) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .filter(|j| task_types.is_empty() || task_types.contains(&j.task_type))
            .min_by_key(|j| (Reverse(j.priority), j.scheduled_at, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.completed_at = None;
        job.attempt_count += 1;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_leased_by(worker_id) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                if let (Some(result), Some(obj)) = (result, job.payload.as_object_mut()) {
                    obj.insert("result".to_string(), result);
                }
                Ok(())
            }
            _ => Err(Self::transition_error(&jobs, job_id, worker_id, "complete")),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: &JobFailure,
        retry_delay: Duration,
    ) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_leased_by(worker_id) => {
                let now = Utc::now();
                if failure.retryable && job.attempt_count < job.max_attempts {
                    job.status = JobStatus::Pending;
                    job.scheduled_at = now.checked_add_signed(retry_delay).unwrap_or(now);
                    job.completed_at = None;
                } else {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                }
                job.last_error = Some(failure.message.clone());
                job.error_code = failure.code.clone();
                Ok(job.status)
            }
            _ => Err(Self::transition_error(&jobs, job_id, worker_id, "fail")),
        }
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|started| started < cutoff);
            if stale {
                job.status = JobStatus::Pending;
                job.last_error = Some(format!(
                    "stale lease reclaimed from {}",
                    job.worker_id.as_deref().unwrap_or("unknown worker")
                ));
                job.error_code = Some("stale".to_string());
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let batch_id = filter.batch_id.map(|id| id.to_string());
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.task_type.as_ref().map_or(true, |t| &j.task_type == t))
            .filter(|j| {
                filter
                    .dedupe_key
                    .as_ref()
                    .map_or(true, |k| j.dedupe_key.as_ref() == Some(k))
            })
            .filter(|j| {
                batch_id.as_deref().map_or(true, |b| {
                    j.payload.get("batch_id").and_then(JsonValue::as_str) == Some(b)
                })
            })
            .cloned()
            .collect();

        matched.sort_by_key(|j| Reverse((j.created_at, j.id)));
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }
}

// =============================================================================
// SIMILARITY RECORDS
// =============================================================================

#[derive(Default)]
struct RecordState {
    by_id: HashMap<Uuid, SimilarityRecord>,
    by_pair_key: HashMap<String, Uuid>,
}

/// In-memory similarity record store with a unique `pair_key`.
#[derive(Default)]
pub struct MemorySimilarityRepository {
    state: Mutex<RecordState>,
}

impl MemorySimilarityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn filtered(state: &RecordState, filter: &ResolvedRecordFilter) -> Vec<SimilarityRecord> {
        state
            .by_id
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SimilarityRepository for MemorySimilarityRepository {
    async fn insert_if_absent(&self, record: &SimilarityRecord) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.by_pair_key.contains_key(&record.pair_key) {
            return Ok(false);
        }
        state.by_pair_key.insert(record.pair_key.clone(), record.id);
        state.by_id.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimilarityRecord>> {
        Ok(self.state.lock().await.by_id.get(&id).cloned())
    }

    async fn get_by_pair_key(&self, pair_key: &str) -> Result<Option<SimilarityRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .by_pair_key
            .get(pair_key)
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn apply_review(
        &self,
        id: Uuid,
        update: &ReviewUpdate,
    ) -> Result<Option<SimilarityRecord>> {
        let mut state = self.state.lock().await;
        Ok(state.by_id.get_mut(&id).map(|record| {
            record.status = update.status;
            record.reviewed_by = update.reviewed_by.clone();
            record.review_note = update.note.clone();
            record.reviewed_at = Some(update.reviewed_at);
            record.clone()
        }))
    }

    async fn swap_workflow_process(
        &self,
        id: Uuid,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.by_id.get_mut(&id) {
            Some(record) if record.workflow_process_id.as_deref() == expected => {
                record.workflow_process_id = next.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: &ResolvedRecordFilter,
        order: RecordOrder,
        limit: usize,
    ) -> Result<Vec<SimilarityRecord>> {
        let state = self.state.lock().await;
        let mut records = Self::filtered(&state, filter);
        match order {
            RecordOrder::Oldest => records.sort_by_key(|r| (r.created_at, r.id)),
            RecordOrder::Newest => records.sort_by_key(|r| Reverse((r.created_at, r.id))),
        }
        records.truncate(limit);
        Ok(records)
    }

    async fn summarize(&self, filter: &ResolvedRecordFilter) -> Result<RecordSummary> {
        let state = self.state.lock().await;
        let mut summary = RecordSummary::default();
        let mut days: BTreeMap<String, DayCount> = BTreeMap::new();

        for record in Self::filtered(&state, filter) {
            let status = record.status.as_str().to_string();
            summary.total += 1;
            *summary.by_status.entry(status.clone()).or_default() += 1;
            if let Some(rule_id) = record.rule_id {
                *summary.by_rule_id.entry(rule_id.to_string()).or_default() += 1;
            }
            match record.batch_id {
                Some(batch_id) => *summary.by_batch_id.entry(batch_id.to_string()).or_default() += 1,
                None => summary.no_batch += 1,
            }

            let day = record.created_at.format("%Y-%m-%d").to_string();
            let entry = days.entry(day.clone()).or_insert_with(|| DayCount {
                day,
                ..Default::default()
            });
            entry.total += 1;
            *entry.by_status.entry(status).or_default() += 1;
        }

        summary.by_day = days.into_values().collect();
        Ok(summary)
    }

    async fn count_for_batch(&self, batch_id: Uuid) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .by_id
            .values()
            .filter(|r| r.batch_id == Some(batch_id))
            .count() as i64)
    }
}

// =============================================================================
// RULES
// =============================================================================

/// In-memory dedup rule store.
#[derive(Default)]
pub struct MemoryRuleRepository {
    rules: Mutex<HashMap<Uuid, DedupRule>>,
}

impl MemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(rules: &HashMap<Uuid, DedupRule>, rule: &DedupRule) -> Result<()> {
        if rules.values().any(|r| r.id != rule.id && r.name == rule.name) {
            return Err(Error::InvalidInput(format!(
                "dedup rule name already exists: {}",
                rule.name
            )));
        }
        if rule.auto_trigger_workflow && rule.workflow_map_id.is_none() {
            return Err(Error::Config(
                "auto_trigger_workflow requires workflow_map_id".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    async fn insert(&self, rule: &DedupRule) -> Result<()> {
        let mut rules = self.rules.lock().await;
        Self::check(&rules, rule)?;
        rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update(&self, rule: &DedupRule) -> Result<()> {
        let mut rules = self.rules.lock().await;
        if !rules.contains_key(&rule.id) {
            return Err(Error::RuleNotFound(rule.id));
        }
        Self::check(&rules, rule)?;
        rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DedupRule>> {
        Ok(self.rules.lock().await.get(&id).cloned())
    }

    async fn list(&self, active_only: bool) -> Result<Vec<DedupRule>> {
        let rules = self.rules.lock().await;
        let mut listed: Vec<DedupRule> = rules
            .values()
            .filter(|r| !active_only || r.is_active)
            .cloned()
            .collect();
        listed.sort_by_key(|r| (r.priority, r.created_at, r.id));
        Ok(listed)
    }
}

// =============================================================================
// BATCHES
// =============================================================================

/// In-memory dedup batch store.
#[derive(Default)]
pub struct MemoryBatchRepository {
    batches: Mutex<HashMap<Uuid, DedupBatch>>,
}

impl MemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn insert(&self, batch: &DedupBatch) -> Result<()> {
        self.batches.lock().await.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn update(&self, batch: &DedupBatch) -> Result<()> {
        let mut batches = self.batches.lock().await;
        match batches.get_mut(&batch.id) {
            Some(stored) => {
                *stored = batch.clone();
                Ok(())
            }
            None => Err(Error::BatchNotFound(batch.id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<DedupBatch>> {
        Ok(self.batches.lock().await.get(&id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DedupBatch>> {
        let batches = self.batches.lock().await;
        let mut listed: Vec<DedupBatch> = batches.values().cloned().collect();
        listed.sort_by_key(|b| Reverse((b.created_at, b.id)));
        listed.truncate(limit.max(0) as usize);
        Ok(listed)
    }
}

// =============================================================================
// FILE CATALOG
// =============================================================================

/// In-memory file catalog.
#[derive(Default)]
pub struct MemoryFileCatalog {
    files: Mutex<BTreeMap<String, CatalogFile>>,
}

impl MemoryFileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, file: CatalogFile) {
        self.files.lock().await.insert(file.file_id.clone(), file);
    }

    /// Register a file with only an id, filename and optional scope fields.
    pub async fn add(
        &self,
        file_id: &str,
        item_type: Option<&str>,
        document_type: Option<&str>,
    ) {
        self.upsert(CatalogFile {
            file_id: file_id.to_string(),
            filename: format!("{file_id}.png"),
            item_type: item_type.map(str::to_string),
            document_type: document_type.map(str::to_string),
            checksum: None,
            created_at: Utc::now(),
        })
        .await;
    }

    fn in_scope(file: &CatalogFile, scope: &BatchScope) -> bool {
        match scope {
            BatchScope::All => true,
            BatchScope::FileList { file_ids } => file_ids.contains(&file.file_id),
            BatchScope::ItemType { item_type } => file.item_type.as_ref() == Some(item_type),
            BatchScope::DocumentType { document_type } => {
                document_type == ANY_DOCUMENT_TYPE
                    || file.document_type.as_ref() == Some(document_type)
            }
        }
    }
}

#[async_trait]
impl FileCatalog for MemoryFileCatalog {
    async fn list_files(
        &self,
        scope: &BatchScope,
        limit: Option<usize>,
    ) -> Result<Vec<CatalogFile>> {
        let files = self.files.lock().await;
        Ok(files
            .values()
            .filter(|f| Self::in_scope(f, scope))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<CatalogFile>> {
        Ok(self.files.lock().await.get(file_id).cloned())
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<String>> {
        let files = self.files.lock().await;
        Ok(files
            .values()
            .find(|f| f.checksum.as_deref() == Some(checksum))
            .map(|f| f.file_id.clone()))
    }
}

// =============================================================================
// BUNDLE
// =============================================================================

/// All in-memory repositories, shareable across tasks.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    pub jobs: Arc<MemoryJobRepository>,
    pub similarities: Arc<MemorySimilarityRepository>,
    pub rules: Arc<MemoryRuleRepository>,
    pub batches: Arc<MemoryBatchRepository>,
    pub catalog: Arc<MemoryFileCatalog>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}
