//! Worker behavior against the in-memory store.
//!
//! Most tests drive executors one step at a time through `run_once` so the
//! outcome of every attempt is deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;

use pairwise_db::MemoryJobRepository;
use pairwise_jobs::{
    JobContext, JobHandler, JobQueue, JobResult, JobStatus, JobWorker, NewJob, RequestContext,
    WorkerBuilder, WorkerConfig, WorkerEvent,
};

/// Fails with `Retry` for the first `transient` calls, then succeeds.
struct FlakyHandler {
    transient: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn task_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.transient {
            JobResult::Retry(format!("transient failure {}", call + 1))
        } else {
            JobResult::Success(Some(json!({"ok": true})))
        }
    }
}

struct FatalHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for FatalHandler {
    fn task_type(&self) -> &str {
        "fatal"
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        JobResult::Failed("source artifact missing".into())
    }
}

struct PanicHandler;

#[async_trait]
impl JobHandler for PanicHandler {
    fn task_type(&self) -> &str {
        "panics"
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        panic!("handler bug");
    }
}

struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    fn task_type(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        JobResult::Success(None)
    }
}

/// Records the payload each execution observed.
#[derive(Clone, Default)]
struct RecordingHandler {
    seen: Arc<Mutex<Vec<JsonValue>>>,
}

#[async_trait]
impl JobHandler for RecordingHandler {
    fn task_type(&self) -> &str {
        "record"
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.seen.lock().await.push(ctx.payload().clone());
        JobResult::Success(None)
    }
}

fn queue() -> JobQueue {
    JobQueue::new(Arc::new(MemoryJobRepository::new()))
}

fn test_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_pool_name("test")
        .with_workers(1)
        .with_poll_interval(10)
        .with_job_timeout(5)
        .with_reap_interval(0)
}

async fn worker_with<H: JobHandler + 'static>(queue: &JobQueue, handler: H) -> JobWorker {
    WorkerBuilder::new(queue.clone())
        .with_config(test_config())
        .with_handler(handler)
        .build()
        .await
}

#[tokio::test]
async fn test_transient_twice_then_success() {
    let queue = queue();
    let ctx = RequestContext::system();
    let worker = worker_with(
        &queue,
        FlakyHandler {
            transient: 2,
            calls: AtomicUsize::new(0),
        },
    )
    .await;

    let outcome = queue
        .enqueue(&ctx, NewJob::new("flaky", json!({})).with_max_attempts(3))
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(worker.run_once("test-0").await.unwrap());
    }
    assert!(!worker.run_once("test-0").await.unwrap());

    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.payload["result"]["ok"], true);
    assert_eq!(job.last_error.as_deref(), Some("transient failure 2"));
}

#[tokio::test]
async fn test_fatal_failure_is_terminal_after_one_attempt() {
    let queue = queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = worker_with(
        &queue,
        FatalHandler {
            calls: calls.clone(),
        },
    )
    .await;

    let outcome = queue
        .enqueue(&RequestContext::system(), NewJob::new("fatal", json!({})))
        .await
        .unwrap();

    assert!(worker.run_once("test-0").await.unwrap());
    assert!(!worker.run_once("test-0").await.unwrap());

    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error_code.as_deref(), Some("fatal"));
    assert_eq!(job.last_error.as_deref(), Some("source artifact missing"));
    assert!(job.completed_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let queue = queue();
    let worker = worker_with(
        &queue,
        FlakyHandler {
            transient: usize::MAX,
            calls: AtomicUsize::new(0),
        },
    )
    .await;

    let outcome = queue
        .enqueue(
            &RequestContext::system(),
            NewJob::new("flaky", json!({})).with_max_attempts(2),
        )
        .await
        .unwrap();

    while worker.run_once("test-0").await.unwrap() {}

    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.error_code.as_deref(), Some("job_failed"));
}

#[tokio::test]
async fn test_panic_is_retryable_failure() {
    let queue = queue();
    let worker = worker_with(&queue, PanicHandler).await;

    let outcome = queue
        .enqueue(
            &RequestContext::system(),
            NewJob::new("panics", json!({})).with_max_attempts(2),
        )
        .await
        .unwrap();

    assert!(worker.run_once("test-0").await.unwrap());
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_code.as_deref(), Some("panic"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retryable_failure() {
    let queue = queue();
    let worker = WorkerBuilder::new(queue.clone())
        .with_config(test_config().with_job_timeout(1))
        .with_handler(SlowHandler)
        .build()
        .await;

    let outcome = queue
        .enqueue(&RequestContext::system(), NewJob::new("slow", json!({})))
        .await
        .unwrap();

    assert!(worker.run_once("test-0").await.unwrap());
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error_code.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_handler_sees_promotion_after_lease() {
    let queue = queue();
    let ctx = RequestContext::system();
    let handler = RecordingHandler::default();
    let worker = worker_with(&queue, handler.clone()).await;

    queue
        .enqueue(
            &ctx,
            NewJob::new("record", json!({"file_id": "f-1", "index": false}))
                .with_dedupe_key("record:f-1"),
        )
        .await
        .unwrap();
    let leased = queue
        .dequeue("test-0", &["record".to_string()])
        .await
        .unwrap()
        .unwrap();

    // Promotion lands between lease and dispatch.
    let promoted = queue
        .enqueue(
            &ctx,
            NewJob::new("record", json!({"file_id": "f-1", "index": true}))
                .with_dedupe_key("record:f-1"),
        )
        .await
        .unwrap();
    assert!(promoted.promoted);

    worker.execute_job("test-0", leased).await;

    let seen = handler.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["index"], true);
}

#[tokio::test]
async fn test_reclaimed_job_past_budget_fails_without_handler() {
    let queue = queue();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = WorkerBuilder::new(queue.clone())
        .with_config(test_config().with_stale_after(0))
        .with_handler(FatalHandler {
            calls: calls.clone(),
        })
        .build()
        .await;

    let outcome = queue
        .enqueue(
            &RequestContext::system(),
            NewJob::new("fatal", json!({})).with_max_attempts(1),
        )
        .await
        .unwrap();

    // Lease held by a worker that crashed.
    queue
        .dequeue("crashed-0", &["fatal".to_string()])
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(worker.reap_once().await.unwrap(), 1);

    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.error_code.as_deref(), Some("stale"));

    assert!(worker.run_once("test-0").await.unwrap());
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.error_code.as_deref(), Some("attempts_exhausted"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_superseded_lease_is_not_dispatched_or_reported() {
    let queue = queue();
    let handler = RecordingHandler::default();
    let worker = WorkerBuilder::new(queue.clone())
        .with_config(test_config().with_stale_after(0))
        .with_handler(handler.clone())
        .build()
        .await;

    let outcome = queue
        .enqueue(&RequestContext::system(), NewJob::new("record", json!({})))
        .await
        .unwrap();
    let types = ["record".to_string()];
    let stale = queue.dequeue("test-0", &types).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(worker.reap_once().await.unwrap(), 1);
    let current = queue.dequeue("test-1", &types).await.unwrap().unwrap();

    worker.execute_job("test-0", stale).await;
    assert!(handler.seen.lock().await.is_empty());
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("test-1"));
    assert!(queue.dequeue("test-2", &types).await.unwrap().is_none());

    worker.execute_job("test-1", current).await;
    assert_eq!(handler.seen.lock().await.len(), 1);
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_reclaim_leaves_fresh_leases_alone() {
    let queue = queue();
    let worker = WorkerBuilder::new(queue.clone())
        .with_config(test_config().with_stale_after(3600))
        .build()
        .await;

    queue
        .enqueue(&RequestContext::system(), NewJob::new("t", json!({})))
        .await
        .unwrap();
    queue.dequeue("w-0", &[]).await.unwrap().unwrap();

    assert_eq!(worker.reap_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pool_processes_every_job_once() {
    let queue = queue();
    let handler = RecordingHandler::default();
    let worker = WorkerBuilder::new(queue.clone())
        .with_config(test_config().with_workers(4))
        .with_handler(handler.clone())
        .build()
        .await;
    let mut events = worker.events();

    let ctx = RequestContext::system();
    for i in 0..20 {
        queue
            .enqueue(&ctx, NewJob::new("record", json!({"n": i})))
            .await
            .unwrap();
    }

    let handle = worker.start();
    let mut completed = 0;
    while completed < 20 {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Ok(WorkerEvent::JobCompleted { .. })) => completed += 1,
            Ok(Ok(_)) => {}
            other => panic!("worker stalled: {other:?}"),
        }
    }
    handle.shutdown().await.unwrap();

    let seen = handler.seen.lock().await;
    let mut ns: Vec<i64> = seen.iter().filter_map(|p| p["n"].as_i64()).collect();
    ns.sort();
    assert_eq!(ns, (0..20).collect::<Vec<_>>());
    assert_eq!(queue.stats().await.unwrap().completed, 20);
}

#[tokio::test]
async fn test_shutdown_emits_lifecycle_events() {
    let queue = queue();
    let worker = worker_with(
        &queue,
        FlakyHandler {
            transient: 0,
            calls: AtomicUsize::new(0),
        },
    )
    .await;
    let mut events = worker.events();

    let handle = worker.start();
    handle.shutdown().await.unwrap();

    assert_eq!(events.recv().await.unwrap(), WorkerEvent::WorkerStarted);
    assert_eq!(events.recv().await.unwrap(), WorkerEvent::WorkerStopped);
}
