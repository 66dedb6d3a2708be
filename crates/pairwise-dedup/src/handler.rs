//! `similarity_match` job handler.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use pairwise_core::{
    defaults, ArtifactStore, CandidatePair, Error, MatchQuery, Result, SimilarityMatcher,
    TaskPayload, SIMILARITY_MATCH,
};
use pairwise_jobs::{JobContext, JobHandler, JobResult};
use pairwise_vision::{extract_matches, VisionMatch};

use crate::rules::MatchSettings;
use crate::service::DedupService;

/// Searches the vision service for duplicates of one file and records every
/// match that clears the governing rule's thresholds.
pub struct SimilarityMatchHandler {
    service: DedupService,
    matcher: Arc<dyn SimilarityMatcher>,
    artifacts: Arc<dyn ArtifactStore>,
    max_results: u32,
}

impl SimilarityMatchHandler {
    pub fn new(
        service: DedupService,
        matcher: Arc<dyn SimilarityMatcher>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            service,
            matcher,
            artifacts,
            max_results: defaults::VISION_MAX_RESULTS,
        }
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    /// Catalog file a match refers to: first by identifier, then by checksum.
    async fn resolve_target(&self, m: &VisionMatch) -> Result<Option<String>> {
        for id in &m.candidate_ids {
            if self.service.catalog().get_file(id).await?.is_some() {
                return Ok(Some(id.clone()));
            }
        }
        for checksum in &m.checksums {
            if let Some(file_id) = self.service.catalog().find_by_checksum(checksum).await? {
                return Ok(Some(file_id));
            }
        }
        Ok(None)
    }

    async fn run(&self, ctx: &JobContext) -> Result<JsonValue> {
        let TaskPayload::SimilarityMatch(payload) = ctx.decode()?;
        let file_id = payload.file_id.trim();

        let file = self
            .service
            .catalog()
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::Fatal(format!("file not found: {file_id}")))?;
        let artifact = self.artifacts.fetch(&file).await?;

        let rule = self
            .service
            .applicable_rule(
                payload.rule_id,
                file.item_type.as_deref(),
                file.document_type.as_deref(),
            )
            .await?;
        let settings = MatchSettings::resolve(rule.as_ref(), payload.mode.as_deref());

        let query = MatchQuery {
            filename: artifact.filename.clone(),
            bytes: artifact.bytes.clone(),
            mode: settings.mode.clone(),
            phash_threshold: settings.thresholds.phash,
            feature_threshold: settings.thresholds.feature,
            max_results: self.max_results,
            exclude_self: true,
        };
        let response = self.matcher.search(&ctx.ctx, &query).await?;
        let matches = extract_matches(&response.body);

        let mut pairs = Vec::new();
        let mut below_threshold = 0usize;
        let mut unresolved = 0usize;
        for m in &matches {
            if !m.passes(&settings.thresholds) {
                below_threshold += 1;
                continue;
            }
            let Some(target) = self.resolve_target(m).await? else {
                debug!(ids = ?m.candidate_ids, "Match does not resolve to a catalog file");
                unresolved += 1;
                continue;
            };
            pairs.push(
                CandidatePair::new(file.file_id.clone(), target, m.score.unwrap_or_default())
                    .with_rule(settings.rule_id)
                    .with_batch(payload.batch_id)
                    .with_mode(settings.mode.clone())
                    .with_params(settings.detection_params(&m.raw)),
            );
        }

        let summary = self.service.ingest(&ctx.ctx, pairs).await?;

        let indexed = if payload.index {
            match self
                .matcher
                .index_add(&ctx.ctx, &artifact, payload.user_name.as_deref())
                .await
            {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "Index add failed, matches kept");
                    json!({ "ok": false, "error": e.to_string() })
                }
            }
        } else {
            JsonValue::Null
        };

        Ok(json!({
            "ok": true,
            "file_id": file.file_id,
            "version": response.version,
            "mode": settings.mode,
            "rule_id": settings.rule_id,
            "batch_id": payload.batch_id,
            "matches": matches.len(),
            "below_threshold": below_threshold,
            "unresolved": unresolved,
            "created": summary.created,
            "existing": summary.existing,
            "skipped": summary.skipped,
            "indexed": indexed,
        }))
    }
}

#[async_trait]
impl JobHandler for SimilarityMatchHandler {
    fn task_type(&self) -> &str {
        SIMILARITY_MATCH
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "dedup", component = "similarity_match", job_id = %ctx.job_id(), attempt = ctx.attempt())
    )]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let start = Instant::now();
        match self.run(&ctx).await {
            Ok(result) => {
                info!(
                    created = result["created"].as_u64().unwrap_or(0),
                    matches = result["matches"].as_u64().unwrap_or(0),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Similarity match finished"
                );
                JobResult::Success(Some(result))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retryable = e.is_retryable(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Similarity match failed"
                );
                JobResult::from_error(e)
            }
        }
    }
}
