//! Queue semantics against the in-memory store.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;

use pairwise_db::MemoryJobRepository;
use pairwise_jobs::{
    DomainEvent, JobQueue, JobStatus, NewJob, RequestContext, SimilarityMatchPayload,
    TaskPayload, SIMILARITY_MATCH,
};

fn queue() -> JobQueue {
    JobQueue::new(Arc::new(MemoryJobRepository::new()))
}

fn match_job(file_id: &str, index: bool) -> NewJob {
    let payload = SimilarityMatchPayload::new(file_id).with_index(index);
    NewJob::new(SIMILARITY_MATCH, serde_json::to_value(&payload).unwrap())
        .with_dedupe_key(payload.dedupe_key())
}

#[tokio::test]
async fn test_promotion_merges_index_flag() {
    let queue = queue();
    let ctx = RequestContext::system();

    let first = queue.enqueue(&ctx, match_job("f-1", false)).await.unwrap();
    let second = queue.enqueue(&ctx, match_job("f-1", true)).await.unwrap();
    let third = queue.enqueue(&ctx, match_job("f-1", false)).await.unwrap();

    assert!(!first.promoted);
    assert!(second.promoted);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(first.job_id, third.job_id);

    let job = queue.get(first.job_id).await.unwrap().unwrap();
    assert_eq!(job.payload["index"], true, "index must never be demoted");
    assert_eq!(queue.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_promotion_reaches_processing_job() {
    let queue = queue();
    let ctx = RequestContext::system();

    let outcome = queue.enqueue(&ctx, match_job("f-2", false)).await.unwrap();
    let leased = queue
        .dequeue("w-0", &[SIMILARITY_MATCH.to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.payload["index"], false);

    let promoted = queue.enqueue(&ctx, match_job("f-2", true)).await.unwrap();
    assert!(promoted.promoted);
    assert_eq!(promoted.job_id, outcome.job_id);

    let live = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(live.status, JobStatus::Processing);
    assert_eq!(live.payload["index"], true);
}

#[tokio::test]
async fn test_finished_job_does_not_absorb_new_work() {
    let queue = queue();
    let ctx = RequestContext::system();

    let first = queue.enqueue(&ctx, match_job("f-3", false)).await.unwrap();
    queue
        .dequeue("w-0", &[SIMILARITY_MATCH.to_string()])
        .await
        .unwrap()
        .unwrap();
    queue.complete(&ctx, first.job_id, "w-0", None).await.unwrap();

    let second = queue.enqueue(&ctx, match_job("f-3", true)).await.unwrap();
    assert!(!second.promoted);
    assert_ne!(first.job_id, second.job_id);
}

#[tokio::test]
async fn test_concurrent_enqueue_converges() {
    let queue = queue();
    let ctx = RequestContext::system();

    let outcomes = join_all((0..16).map(|i| {
        let queue = queue.clone();
        let ctx = ctx.clone();
        async move { queue.enqueue(&ctx, match_job("f-4", i == 11)).await.unwrap() }
    }))
    .await;

    let id = outcomes[0].job_id;
    assert!(outcomes.iter().all(|o| o.job_id == id));
    assert_eq!(outcomes.iter().filter(|o| !o.promoted).count(), 1);
    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.payload["index"], true);
}

#[tokio::test]
async fn test_concurrent_dequeue_is_exclusive() {
    let queue = queue();
    let ctx = RequestContext::system();
    for i in 0..10 {
        queue
            .enqueue(&ctx, NewJob::new("exclusive", json!({"n": i})))
            .await
            .unwrap();
    }

    let types = vec!["exclusive".to_string()];
    let leased = join_all((0..32).map(|i| {
        let queue = queue.clone();
        let types = types.clone();
        async move { queue.dequeue(&format!("w-{i}"), &types).await.unwrap() }
    }))
    .await;

    let mut ids: Vec<_> = leased.into_iter().flatten().map(|j| j.id).collect();
    assert_eq!(ids.len(), 10);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn test_cancel_only_while_pending() {
    let queue = queue();
    let ctx = RequestContext::system();

    let pending = queue.enqueue(&ctx, NewJob::new("c", json!({}))).await.unwrap();
    assert!(queue.cancel(&ctx, pending.job_id).await.unwrap());
    assert!(!queue.cancel(&ctx, pending.job_id).await.unwrap());

    let leased = queue.enqueue(&ctx, NewJob::new("c", json!({}))).await.unwrap();
    queue.dequeue("w-0", &["c".to_string()]).await.unwrap();
    assert!(!queue.cancel(&ctx, leased.job_id).await.unwrap());
    let job = queue.get(leased.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_enqueue_publishes_events() {
    let queue = queue();
    let mut rx = queue.events().subscribe();
    let ctx = RequestContext::for_user("alice");

    let outcome = queue.enqueue(&ctx, match_job("f-5", false)).await.unwrap();
    queue.enqueue(&ctx, match_job("f-5", true)).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(
        first.payload,
        DomainEvent::JobEnqueued {
            job_id: outcome.job_id,
            task_type: SIMILARITY_MATCH.to_string(),
        }
    );
    let second = rx.recv().await.unwrap();
    assert!(matches!(second.payload, DomainEvent::JobPromoted { .. }));
}

#[tokio::test]
async fn test_enqueue_task_uses_payload_dedupe_key() {
    let queue = queue();
    let ctx = RequestContext::system();
    let payload = TaskPayload::SimilarityMatch(SimilarityMatchPayload::new("f-6"));

    let outcome = queue.enqueue_task(&ctx, &payload, 20).await.unwrap();
    let job = queue.get(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.dedupe_key.as_deref(), Some("similarity_match:f-6"));
    assert_eq!(job.priority, 20);
}
