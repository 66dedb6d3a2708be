//! `similarity_match` jobs run end to end through a worker and the
//! in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pairwise_core::{
    Artifact, CatalogFile, CreateRuleRequest, Error, JobStatus, MatchQuery, MatchResponse,
    RecordFilter, RequestContext, Result, SimilarityMatchPayload, SimilarityMatcher, TaskPayload,
    WireVersion,
};
use pairwise_db::MemoryDatabase;
use pairwise_dedup::{DedupService, MemoryArtifactStore, SimilarityMatchHandler};
use pairwise_jobs::{JobQueue, JobWorker, WorkerBuilder};
use pairwise_vision::{VisionClient, VisionConfig};

/// Answers every search with a canned body.
struct MockMatcher {
    body: JsonValue,
    search_error: bool,
    index_error: bool,
    queries: Mutex<Vec<MatchQuery>>,
    indexed: AtomicUsize,
}

impl MockMatcher {
    fn new(body: JsonValue) -> Self {
        Self {
            body,
            search_error: false,
            index_error: false,
            queries: Mutex::new(Vec::new()),
            indexed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SimilarityMatcher for MockMatcher {
    async fn search(&self, _ctx: &RequestContext, query: &MatchQuery) -> Result<MatchResponse> {
        self.queries.lock().await.push(query.clone());
        if self.search_error {
            return Err(Error::Request("connection refused".into()));
        }
        Ok(MatchResponse {
            version: WireVersion::V2,
            body: self.body.clone(),
        })
    }

    async fn index_add(
        &self,
        _ctx: &RequestContext,
        _artifact: &Artifact,
        _user_name: Option<&str>,
    ) -> Result<JsonValue> {
        self.indexed.fetch_add(1, Ordering::SeqCst);
        if self.index_error {
            return Err(Error::Request("index unavailable".into()));
        }
        Ok(json!({"ok": true}))
    }

    async fn health(&self, _ctx: &RequestContext) -> Result<JsonValue> {
        Ok(json!({"status": "ok"}))
    }
}

struct Harness {
    db: MemoryDatabase,
    service: DedupService,
    worker: JobWorker,
}

async fn harness(matcher: Arc<dyn SimilarityMatcher>) -> Harness {
    let db = MemoryDatabase::new();
    let queue = JobQueue::new(db.jobs.clone());
    let service = DedupService::from_memory(&db, queue.clone());

    let artifacts = Arc::new(MemoryArtifactStore::new());
    for id in ["f-1", "f-2", "f-3", "f-4"] {
        artifacts.put(id, format!("bytes of {id}").into_bytes()).await;
    }
    db.catalog.add("f-1", Some("Part"), Some("drawing")).await;
    db.catalog.add("f-2", Some("Part"), Some("drawing")).await;
    db.catalog.add("f-3", Some("Part"), Some("drawing")).await;
    db.catalog
        .upsert(CatalogFile {
            file_id: "f-4".into(),
            filename: "f-4.png".into(),
            item_type: Some("Part".into()),
            document_type: Some("drawing".into()),
            checksum: Some("abc123".into()),
            created_at: Utc::now(),
        })
        .await;

    let handler = SimilarityMatchHandler::new(service.clone(), matcher, artifacts);
    let worker = WorkerBuilder::new(queue).with_handler(handler).build().await;
    Harness { db, service, worker }
}

async fn enqueue(h: &Harness, payload: SimilarityMatchPayload) -> uuid::Uuid {
    h.service
        .queue()
        .enqueue_task(
            &RequestContext::for_user("alice"),
            &TaskPayload::SimilarityMatch(payload),
            10,
        )
        .await
        .unwrap()
        .job_id
}

#[tokio::test]
async fn test_matches_above_threshold_become_records() {
    let matcher = Arc::new(MockMatcher::new(json!({
        "results": [
            {"file_id": "f-2", "similarity": 0.95},
            {"file_id": "f-3", "similarity": 0.40},
            {"checksum": "abc123", "score": 0.91},
            {"file_id": "f-1", "similarity": 0.99},
            {"file_id": "ghost", "similarity": 0.99}
        ]
    })));
    let h = harness(matcher.clone()).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-1")).await;

    assert!(h.worker.run_once("w-1").await.unwrap());

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = &job.payload["result"];
    assert_eq!(result["matches"], 5);
    assert_eq!(result["below_threshold"], 1);
    assert_eq!(result["unresolved"], 1);
    assert_eq!(result["created"], 2);
    assert_eq!(result["skipped"], 1);
    assert_eq!(result["version"], "v2");
    assert!(result["indexed"].is_null());

    let rows = h
        .service
        .list_records_for_export(&RecordFilter::default(), None)
        .await
        .unwrap();
    let mut keys: Vec<&str> = rows.iter().map(|r| r.pair_key.as_str()).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["f-1|f-2", "f-1|f-4"]);
    assert!(rows.iter().all(|r| r.detection_mode.as_deref() == Some("balanced")));

    let queries = matcher.queries.lock().await;
    assert_eq!(queries.len(), 1);
    assert!(queries[0].exclude_self);
    assert_eq!(queries[0].bytes, b"bytes of f-1");
    assert_eq!(matcher.indexed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rule_thresholds_and_mode_apply() {
    let matcher = Arc::new(MockMatcher::new(json!({
        "results": [
            {"file_id": "f-2", "similarity": 0.95, "phash_distance": 8},
            {"file_id": "f-3", "similarity": 0.95, "levels": {"l1": {"phash_distance": 2}}}
        ]
    })));
    let h = harness(matcher.clone()).await;
    let rule = h
        .service
        .create_rule(
            &RequestContext::system(),
            CreateRuleRequest {
                name: "strict parts".into(),
                item_type: Some("Part".into()),
                phash_threshold: Some(5),
                mode: Some("accurate".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-1")).await;
    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.payload["result"]["created"], 1);
    assert_eq!(job.payload["result"]["below_threshold"], 1);
    assert_eq!(job.payload["result"]["rule_id"], json!(rule.id));

    let rows = h
        .service
        .list_records_for_export(&RecordFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pair_key, "f-1|f-3");
    assert_eq!(rows[0].rule_id, Some(rule.id));

    let queries = matcher.queries.lock().await;
    assert_eq!(queries[0].mode, "accurate");
    assert_eq!(queries[0].phash_threshold, 5);
}

#[tokio::test]
async fn test_job_mode_overrides_rule_mode() {
    let matcher = Arc::new(MockMatcher::new(json!({"results": []})));
    let h = harness(matcher.clone()).await;
    h.service
        .create_rule(
            &RequestContext::system(),
            CreateRuleRequest {
                name: "parts".into(),
                item_type: Some("Part".into()),
                mode: Some("accurate".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    enqueue(&h, SimilarityMatchPayload::new("f-1").with_mode("fast")).await;
    h.worker.run_once("w-1").await.unwrap();

    assert_eq!(matcher.queries.lock().await[0].mode, "fast");
}

#[tokio::test]
async fn test_index_flag_adds_to_index() {
    let matcher = Arc::new(MockMatcher::new(json!({"results": []})));
    let h = harness(matcher.clone()).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-2").with_index(true)).await;

    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.payload["result"]["indexed"]["ok"], true);
    assert_eq!(matcher.indexed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_index_failure_is_absorbed() {
    let mut mock = MockMatcher::new(json!({
        "results": [{"file_id": "f-3", "similarity": 0.9}]
    }));
    mock.index_error = true;
    let h = harness(Arc::new(mock)).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-2").with_index(true)).await;

    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.payload["result"]["indexed"]["ok"], false);
    assert_eq!(job.payload["result"]["created"], 1);
    assert_eq!(h.db.similarities.len().await, 1);
}

#[tokio::test]
async fn test_missing_file_fails_without_retry() {
    let matcher = Arc::new(MockMatcher::new(json!({"results": []})));
    let h = harness(matcher.clone()).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("nope")).await;

    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error_code.as_deref(), Some("fatal"));
    assert!(matcher.queries.lock().await.is_empty());
}

#[tokio::test]
async fn test_matcher_outage_is_retried() {
    let mut mock = MockMatcher::new(json!({}));
    mock.search_error = true;
    let h = harness(Arc::new(mock)).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-1")).await;

    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error_code.as_deref(), Some("job_failed"));
    assert!(job.last_error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_batch_jobs_tag_records_with_batch() {
    let matcher = Arc::new(MockMatcher::new(json!({
        "results": [{"file_id": "f-2", "similarity": 0.9}]
    })));
    let h = harness(matcher).await;
    let batch_id = uuid::Uuid::now_v7();
    enqueue(&h, SimilarityMatchPayload::new("f-1").with_batch(batch_id)).await;

    h.worker.run_once("w-1").await.unwrap();

    let rows = h
        .service
        .list_records_for_export(
            &RecordFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_pipeline_against_vision_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "search": {
                "duplicates": [{"drawing_id": "f-3", "confidence": 0.97}]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = VisionClient::new(VisionConfig::new(server.uri()).with_timeout(5)).unwrap();
    let h = harness(Arc::new(client)).await;
    let job_id = enqueue(&h, SimilarityMatchPayload::new("f-1")).await;

    h.worker.run_once("w-1").await.unwrap();

    let job = h.service.queue().get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.payload["result"]["version"], "v2");

    let rows = h
        .service
        .list_records_for_export(&RecordFilter::default(), None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pair_key, "f-1|f-3");
    assert!((rows[0].score - 0.97).abs() < f64::EPSILON);
}
