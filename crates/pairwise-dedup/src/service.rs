//! Dedup service: rules, ingestion, batches, review and reporting.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use pairwise_core::{
    defaults, BatchRepository, BatchStatus, CandidatePair, CreateBatchRequest, CreateRuleRequest,
    DedupBatch, DedupRule, DomainEvent, Error, EventBus, FileCatalog, IngestSummary, Job,
    JobFilter, JobStatus, NewJob, Outbox, RecordFilter, RecordOrder, RequestContext, Result,
    ResolvedRecordFilter, ReviewDecision, ReviewUpdate, RuleRepository, SimilarityMatchPayload,
    SimilarityRecord, SimilarityRepository, SimilarityStatus, UpdateRuleRequest, WorkflowStartRequest,
    WorkflowTrigger, SIMILARITY_MATCH,
};
use pairwise_db::{Database, MemoryDatabase};
use pairwise_jobs::JobQueue;
use pairwise_vision::{is_known_mode, normalize_legacy_mode};

use crate::report::{to_csv, DedupReport, ExportRow};
use crate::rules::{apply_update, build_rule, select_applicable};
use crate::workflow::DisabledWorkflowTrigger;

/// Placeholder held in `workflow_process_id` while a workflow is starting.
pub const WORKFLOW_CLAIM_PREFIX: &str = "starting:";

/// Options for [`DedupService::run_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunBatchOptions {
    /// Also add every file to the search index.
    pub index: bool,
    /// Legacy mode; defaults to the rule's mode.
    pub mode: Option<String>,
    pub priority: i32,
    /// Cap on the number of files enqueued.
    pub limit: Option<usize>,
    /// Coalesce with live jobs for the same file.
    pub dedupe: bool,
    /// Overrides the batch's rule.
    pub rule_id: Option<Uuid>,
}

impl Default for RunBatchOptions {
    fn default() -> Self {
        Self {
            index: false,
            mode: None,
            priority: defaults::DEDUP_BATCH_PRIORITY,
            limit: None,
            dedupe: true,
            rule_id: None,
        }
    }
}

impl RunBatchOptions {
    pub fn with_index(mut self, index: bool) -> Self {
        self.index = index;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }
}

/// Jobs spawned by a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunBatchOutcome {
    pub jobs: usize,
    /// One id per file, in catalog order. Promoted jobs keep their id.
    pub job_ids: Vec<Uuid>,
}

/// Similarity dedup domain service.
///
/// Owns rules and batches, ingests candidate pairs and drives the review
/// workflow. All storage goes through the repository traits, so the same
/// service runs against Postgres or the in-memory store.
#[derive(Clone)]
pub struct DedupService {
    records: Arc<dyn SimilarityRepository>,
    rules: Arc<dyn RuleRepository>,
    batches: Arc<dyn BatchRepository>,
    catalog: Arc<dyn FileCatalog>,
    queue: JobQueue,
    workflow: Arc<dyn WorkflowTrigger>,
}

impl DedupService {
    pub fn new(
        records: Arc<dyn SimilarityRepository>,
        rules: Arc<dyn RuleRepository>,
        batches: Arc<dyn BatchRepository>,
        catalog: Arc<dyn FileCatalog>,
        queue: JobQueue,
    ) -> Self {
        Self {
            records,
            rules,
            batches,
            catalog,
            queue,
            workflow: Arc::new(DisabledWorkflowTrigger),
        }
    }

    /// Service over the Postgres repositories.
    pub fn from_database(db: &Database, queue: JobQueue) -> Self {
        Self::new(
            Arc::new(db.similarities.clone()),
            Arc::new(db.rules.clone()),
            Arc::new(db.batches.clone()),
            Arc::new(db.catalog.clone()),
            queue,
        )
    }

    /// Service over the in-memory repositories.
    pub fn from_memory(db: &MemoryDatabase, queue: JobQueue) -> Self {
        Self::new(
            db.similarities.clone(),
            db.rules.clone(),
            db.batches.clone(),
            db.catalog.clone(),
            queue,
        )
    }

    pub fn with_workflow_trigger(mut self, workflow: Arc<dyn WorkflowTrigger>) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn catalog(&self) -> &Arc<dyn FileCatalog> {
        &self.catalog
    }

    fn events(&self) -> &EventBus {
        self.queue.events()
    }

    // =========================================================================
    // Rules
    // =========================================================================

    #[instrument(skip(self, ctx, req), fields(subsystem = "dedup", component = "rules", op = "create_rule"))]
    pub async fn create_rule(&self, ctx: &RequestContext, req: CreateRuleRequest) -> Result<DedupRule> {
        let rule = build_rule(ctx, req, Utc::now())?;
        self.rules.insert(&rule).await?;

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::RuleChanged { rule_id: rule.id });
        outbox.flush(self.events(), ctx);

        info!(rule_id = %rule.id, name = %rule.name, "Dedup rule created");
        Ok(rule)
    }

    #[instrument(skip(self, ctx, req), fields(subsystem = "dedup", component = "rules", op = "update_rule", rule_id = %id))]
    pub async fn update_rule(
        &self,
        ctx: &RequestContext,
        id: Uuid,
        req: UpdateRuleRequest,
    ) -> Result<DedupRule> {
        let current = self.rules.get(id).await?.ok_or(Error::RuleNotFound(id))?;
        let rule = apply_update(&current, req, Utc::now())?;
        self.rules.update(&rule).await?;

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::RuleChanged { rule_id: rule.id });
        outbox.flush(self.events(), ctx);

        info!("Dedup rule updated");
        Ok(rule)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<DedupRule>> {
        self.rules.get(id).await
    }

    /// Rules ordered by priority; inactive rules only when requested.
    pub async fn list_rules(&self, include_inactive: bool) -> Result<Vec<DedupRule>> {
        self.rules.list(!include_inactive).await
    }

    pub async fn deactivate_rule(&self, ctx: &RequestContext, id: Uuid) -> Result<DedupRule> {
        self.update_rule(
            ctx,
            id,
            UpdateRuleRequest {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Rule governing a file.
    ///
    /// An explicit `rule_id` that still exists wins. Otherwise the active
    /// rules are searched by item type, then document type, then global.
    pub async fn applicable_rule(
        &self,
        rule_id: Option<Uuid>,
        item_type: Option<&str>,
        document_type: Option<&str>,
    ) -> Result<Option<DedupRule>> {
        if let Some(id) = rule_id {
            match self.rules.get(id).await? {
                Some(rule) => return Ok(Some(rule)),
                None => warn!(
                    subsystem = "dedup",
                    rule_id = %id,
                    "Requested dedup rule not found, resolving by scope"
                ),
            }
        }
        let rules = self.rules.list(true).await?;
        Ok(select_applicable(&rules, item_type, document_type).cloned())
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Persist candidate pairs, one record per unordered pair.
    ///
    /// Self-pairs and pairs with a blank side are skipped. Pairs that already
    /// exist, including ones inserted concurrently, count as `existing`.
    #[instrument(skip(self, ctx, pairs), fields(subsystem = "dedup", component = "ingest", op = "ingest", pairs = pairs.len()))]
    pub async fn ingest(&self, ctx: &RequestContext, pairs: Vec<CandidatePair>) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut outbox = Outbox::new();
        let now = Utc::now();

        let mut failure = None;
        for pair in pairs {
            if pair.is_self_pair()
                || pair.source_file_id.trim().is_empty()
                || pair.target_file_id.trim().is_empty()
            {
                summary.skipped += 1;
                continue;
            }
            let record = pair.into_record(now);
            match self.records.insert_if_absent(&record).await {
                Ok(true) => {
                    summary.created += 1;
                    outbox.push(DomainEvent::SimilarityRecordCreated {
                        record_id: record.id,
                        pair_key: record.pair_key.clone(),
                    });
                }
                Ok(false) => {
                    debug!(pair_key = %record.pair_key, "Pair already recorded");
                    summary.existing += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Rows inserted before a failure are committed; publish them either way.
        outbox.flush(self.events(), ctx);
        if let Some(e) = failure {
            return Err(e);
        }

        debug!(
            created = summary.created,
            existing = summary.existing,
            skipped = summary.skipped,
            "Ingest finished"
        );
        Ok(summary)
    }

    pub async fn get_record(&self, id: Uuid) -> Result<Option<SimilarityRecord>> {
        self.records.get(id).await
    }

    /// Record a review decision.
    ///
    /// Confirming a record governed by a rule with `auto_trigger_workflow`
    /// starts that rule's workflow. A failed trigger is logged and the
    /// review still succeeds.
    #[instrument(skip(self, ctx, note), fields(subsystem = "dedup", component = "review", op = "review_record", record_id = %record_id))]
    pub async fn review_record(
        &self,
        ctx: &RequestContext,
        record_id: Uuid,
        decision: ReviewDecision,
        note: Option<String>,
    ) -> Result<SimilarityRecord> {
        let update = ReviewUpdate {
            status: decision.status(),
            reviewed_by: ctx.user_id.clone(),
            note,
            reviewed_at: Utc::now(),
        };
        let mut record = self
            .records
            .apply_review(record_id, &update)
            .await?
            .ok_or(Error::RecordNotFound(record_id))?;

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::SimilarityRecordReviewed {
            record_id,
            status: record.status.as_str().to_string(),
        });
        outbox.flush(self.events(), ctx);

        if record.status == SimilarityStatus::Confirmed {
            match self.trigger_workflow_for_record(ctx, &record).await {
                Ok(Some(process_id)) => record.workflow_process_id = Some(process_id),
                Ok(None) => {}
                Err(e) => warn!(
                    error = %e,
                    "Workflow trigger failed, review kept"
                ),
            }
        }

        info!(status = %record.status, "Similarity record reviewed");
        Ok(record)
    }

    /// Start the owning rule's workflow for a confirmed record.
    ///
    /// Returns `Ok(None)` when no workflow applies: the record has no rule,
    /// the rule does not auto-trigger, or a process was already started.
    ///
    /// The record is claimed with a `starting:` marker before the port is
    /// called, so concurrent confirmations start at most one process. A
    /// failed start releases the claim.
    pub async fn trigger_workflow_for_record(
        &self,
        ctx: &RequestContext,
        record: &SimilarityRecord,
    ) -> Result<Option<String>> {
        if record.workflow_process_id.is_some() {
            return Ok(None);
        }
        let Some(rule_id) = record.rule_id else {
            return Ok(None);
        };
        let Some(rule) = self.rules.get(rule_id).await? else {
            return Ok(None);
        };
        if !rule.auto_trigger_workflow {
            return Ok(None);
        }
        let Some(workflow_map_id) = rule.workflow_map_id else {
            return Ok(None);
        };

        let request = WorkflowStartRequest {
            workflow_map_id: workflow_map_id.clone(),
            record_id: record.id,
            source_file_id: record.source_file_id.clone(),
            target_file_id: record.target_file_id.clone(),
        };
        let claim = format!("{WORKFLOW_CLAIM_PREFIX}{}", Uuid::now_v7());
        if !self
            .records
            .swap_workflow_process(record.id, None, Some(&claim))
            .await?
        {
            debug!(record_id = %record.id, "Workflow already started for record");
            return Ok(None);
        }

        let process_id = match self.workflow.start(ctx, &request).await {
            Ok(process_id) => process_id,
            Err(e) => {
                if let Err(release) = self
                    .records
                    .swap_workflow_process(record.id, Some(&claim), None)
                    .await
                {
                    warn!(record_id = %record.id, error = %release, "Failed to release workflow claim");
                }
                return Err(e);
            }
        };
        let recorded = self
            .records
            .swap_workflow_process(record.id, Some(&claim), Some(&process_id))
            .await?;
        if !recorded {
            warn!(record_id = %record.id, %process_id, "Workflow claim replaced while starting");
        }

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::WorkflowTriggered {
            record_id: record.id,
            workflow_map_id: workflow_map_id.clone(),
            process_id: process_id.clone(),
        });
        outbox.flush(self.events(), ctx);

        info!(
            subsystem = "dedup",
            component = "review",
            record_id = %record.id,
            workflow_map_id = %workflow_map_id,
            process_id = %process_id,
            "Workflow triggered for confirmed duplicate"
        );
        Ok(Some(process_id))
    }

    // =========================================================================
    // Batches
    // =========================================================================

    pub async fn create_batch(&self, ctx: &RequestContext, req: CreateBatchRequest) -> Result<DedupBatch> {
        if let Some(rule_id) = req.rule_id {
            if self.rules.get(rule_id).await?.is_none() {
                return Err(Error::RuleNotFound(rule_id));
            }
        }
        let batch = DedupBatch {
            id: Uuid::now_v7(),
            name: req.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            scope: req.scope,
            rule_id: req.rule_id,
            status: BatchStatus::Queued,
            jobs_spawned: 0,
            total_files: 0,
            processed_files: 0,
            found_similarities: 0,
            summary: json!({}),
            error_message: None,
            created_by: ctx.user_id.clone(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.batches.insert(&batch).await?;
        debug!(subsystem = "dedup", batch_id = %batch.id, "Dedup batch created");
        Ok(batch)
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<Option<DedupBatch>> {
        self.batches.get(id).await
    }

    pub async fn list_batches(&self, limit: i64) -> Result<Vec<DedupBatch>> {
        self.batches.list(limit).await
    }

    /// Enqueue one `similarity_match` job per file in the batch scope.
    ///
    /// With `dedupe` each job carries the key `similarity_match:<file_id>`,
    /// so a file with a live job gets that job promoted instead of a second
    /// one.
    #[instrument(skip(self, ctx, opts), fields(subsystem = "dedup", component = "batch", op = "run_batch", batch_id = %batch_id))]
    pub async fn run_batch(
        &self,
        ctx: &RequestContext,
        batch_id: Uuid,
        opts: RunBatchOptions,
    ) -> Result<RunBatchOutcome> {
        let mut batch = self
            .batches
            .get(batch_id)
            .await?
            .ok_or(Error::BatchNotFound(batch_id))?;

        let rule = match opts.rule_id.or(batch.rule_id) {
            Some(id) => Some(self.rules.get(id).await?.ok_or(Error::RuleNotFound(id))?),
            None => None,
        };
        let mode = match opts.mode.as_deref() {
            Some(mode) if !is_known_mode(mode) => {
                return Err(Error::InvalidInput(format!("unknown detection mode: {mode}")));
            }
            Some(mode) => normalize_legacy_mode(mode),
            None => rule
                .as_ref()
                .map(|r| r.mode.clone())
                .unwrap_or_else(|| defaults::DEDUP_MODE.to_string()),
        };

        let files = self.catalog.list_files(&batch.scope, opts.limit).await?;

        let mut job_ids = Vec::with_capacity(files.len());
        let mut promoted = 0usize;
        for file in &files {
            let mut payload = SimilarityMatchPayload::new(file.file_id.clone())
                .with_index(opts.index)
                .with_mode(mode.clone())
                .with_batch(batch.id)
                .with_user_name(ctx.actor());
            if let Some(rule) = &rule {
                payload = payload.with_rule(rule.id);
            }

            let mut job = NewJob::new(SIMILARITY_MATCH, serde_json::to_value(&payload)?)
                .with_priority(opts.priority);
            if opts.dedupe {
                job = job.with_dedupe_key(payload.dedupe_key());
            }
            let outcome = self.queue.enqueue(ctx, job).await?;
            if outcome.promoted {
                promoted += 1;
            }
            job_ids.push(outcome.job_id);
        }

        let now = Utc::now();
        batch.started_at = Some(now);
        batch.total_files = count_i32(files.len());
        batch.jobs_spawned = count_i32(job_ids.len());
        batch.processed_files = 0;
        batch.error_message = None;
        if files.is_empty() {
            batch.status = BatchStatus::Completed;
            batch.completed_at = Some(now);
        } else {
            batch.status = BatchStatus::Running;
            batch.completed_at = None;
        }
        let mut summary = as_object(&batch.summary);
        summary.insert("jobs_created".into(), json!(job_ids.len()));
        summary.insert("jobs_promoted".into(), json!(promoted));
        summary.insert("mode".into(), json!(mode));
        summary.insert("rule_id".into(), json!(rule.as_ref().map(|r| r.id)));
        summary.insert("index".into(), json!(opts.index));
        summary.insert("job_ids".into(), json!(job_ids));
        if let Some(limit) = opts.limit {
            summary.insert("limit".into(), json!(limit));
        }
        batch.summary = JsonValue::Object(summary);
        self.batches.update(&batch).await?;

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::BatchStarted {
            batch_id,
            jobs_spawned: job_ids.len(),
        });
        outbox.flush(self.events(), ctx);

        info!(
            jobs = job_ids.len(),
            promoted,
            mode = %mode,
            index = opts.index,
            "Dedup batch started"
        );
        Ok(RunBatchOutcome {
            jobs: job_ids.len(),
            job_ids,
        })
    }

    /// Recompute a batch's counts and status from its jobs and records.
    ///
    /// Any pending or processing job keeps the batch running; otherwise a
    /// failed job fails it and it completes.
    #[instrument(skip(self, ctx), fields(subsystem = "dedup", component = "batch", op = "refresh_batch", batch_id = %batch_id))]
    pub async fn refresh_batch(&self, ctx: &RequestContext, batch_id: Uuid) -> Result<DedupBatch> {
        let mut batch = self
            .batches
            .get(batch_id)
            .await?
            .ok_or(Error::BatchNotFound(batch_id))?;

        batch.found_similarities = self.records.count_for_batch(batch_id).await?;

        let jobs = self.batch_jobs(&batch).await?;
        if jobs.is_empty() && batch.status == BatchStatus::Queued {
            self.batches.update(&batch).await?;
            return Ok(batch);
        }

        let mut counts: BTreeMap<String, i64> = JobStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for job in &jobs {
            *counts.entry(job.status.as_str().to_string()).or_default() += 1;
        }
        let count = |s: JobStatus| counts.get(s.as_str()).copied().unwrap_or(0);

        batch.total_files = count_i32(jobs.len());
        batch.processed_files = i32::try_from(
            count(JobStatus::Completed) + count(JobStatus::Failed) + count(JobStatus::Cancelled),
        )
        .unwrap_or(i32::MAX);

        if count(JobStatus::Pending) > 0 || count(JobStatus::Processing) > 0 {
            batch.status = BatchStatus::Running;
            batch.completed_at = None;
        } else {
            batch.status = if count(JobStatus::Failed) > 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            batch.completed_at.get_or_insert_with(Utc::now);
            batch.error_message = (batch.status == BatchStatus::Failed)
                .then(|| format!("{} job(s) failed", count(JobStatus::Failed)));
        }

        let mut summary = as_object(&batch.summary);
        summary.insert("job_status".into(), json!(counts));
        batch.summary = JsonValue::Object(summary);
        self.batches.update(&batch).await?;

        let mut outbox = Outbox::new();
        outbox.push(DomainEvent::BatchRefreshed {
            batch_id,
            status: batch.status.as_str().to_string(),
        });
        outbox.flush(self.events(), ctx);

        debug!(
            status = batch.status.as_str(),
            processed = batch.processed_files,
            found = batch.found_similarities,
            "Dedup batch refreshed"
        );
        Ok(batch)
    }

    /// Jobs of a batch: the ids recorded by `run_batch`, or a payload lookup
    /// for batches run before ids were recorded.
    async fn batch_jobs(&self, batch: &DedupBatch) -> Result<Vec<Job>> {
        let recorded: Option<Vec<Uuid>> = batch
            .summary
            .get("job_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        match recorded {
            Some(ids) => {
                let mut seen = std::collections::HashSet::new();
                let mut jobs = Vec::with_capacity(ids.len());
                for id in ids {
                    if !seen.insert(id) {
                        continue;
                    }
                    if let Some(job) = self.queue.get(id).await? {
                        jobs.push(job);
                    }
                }
                Ok(jobs)
            }
            None => {
                self.queue
                    .list(&JobFilter {
                        task_type: Some(SIMILARITY_MATCH.to_string()),
                        batch_id: Some(batch.id),
                        ..Default::default()
                    })
                    .await
            }
        }
    }

    // =========================================================================
    // Reports
    // =========================================================================

    fn resolve_filter(filter: &RecordFilter) -> Result<ResolvedRecordFilter> {
        filter
            .resolve(Utc::now())
            .ok_or_else(|| Error::InvalidInput("start_date must be <= end_date".into()))
    }

    /// Counts by status, rule, batch and day plus the latest records.
    #[instrument(skip(self, filter), fields(subsystem = "dedup", component = "report", op = "generate_report"))]
    pub async fn generate_report(&self, filter: &RecordFilter, latest_limit: usize) -> Result<DedupReport> {
        let resolved = Self::resolve_filter(filter)?;
        let summary = self.records.summarize(&resolved).await?;
        let latest = if latest_limit > 0 {
            self.records
                .list(&resolved, RecordOrder::Newest, latest_limit)
                .await?
        } else {
            Vec::new()
        };
        Ok(DedupReport::new(Utc::now(), &resolved, summary, &latest))
    }

    /// Flat record list in stable `created_at ASC, id ASC` order.
    pub async fn list_records_for_export(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ExportRow>> {
        let resolved = Self::resolve_filter(filter)?;
        let records = self
            .records
            .list(
                &resolved,
                RecordOrder::Oldest,
                limit.unwrap_or(defaults::EXPORT_LIMIT),
            )
            .await?;
        Ok(records.iter().map(ExportRow::from).collect())
    }

    pub async fn export_csv(&self, filter: &RecordFilter, limit: Option<usize>) -> Result<String> {
        let rows = self.list_records_for_export(filter, limit).await?;
        Ok(to_csv(&rows))
    }
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn as_object(value: &JsonValue) -> serde_json::Map<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}
