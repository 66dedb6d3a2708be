//! Job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use pairwise_core::{
    defaults, promote_payload, EnqueueOutcome, Error, Job, JobFailure, JobFilter, JobRepository,
    JobStatus, NewJob, QueueStats, RequestContext, Result,
};

const JOB_COLUMNS: &str = "id, task_type, payload, status, priority, dedupe_key, worker_id, \
     attempt_count, max_attempts, last_error, error_code, tenant_id, org_id, created_by, \
     scheduled_at, started_at, completed_at, created_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.get("status");
        let status = JobStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown job status in store: {status}")))?;
        Ok(Job {
            id: row.get("id"),
            task_type: row.get("task_type"),
            payload: row.get("payload"),
            status,
            priority: row.get("priority"),
            dedupe_key: row.get("dedupe_key"),
            worker_id: row.get("worker_id"),
            attempt_count: row.get("attempt_count"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            error_code: row.get("error_code"),
            tenant_id: row.get("tenant_id"),
            org_id: row.get("org_id"),
            created_by: row.get("created_by"),
            scheduled_at: row.get("scheduled_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
        })
    }

    /// Explain why a conditional transition matched no row.
    async fn transition_error(&self, job_id: Uuid, worker_id: &str, op: &str) -> Error {
        match self.get(job_id).await {
            Ok(Some(job)) => lease_error(&job, worker_id, op),
            Ok(None) => Error::JobNotFound(job_id),
            Err(e) => e,
        }
    }

    /// Merge `incoming` into the live job holding `dedupe_key`.
    ///
    /// Returns `None` when no live job holds the key any more (it reached a
    /// terminal state between the conflicting insert and this lock).
    async fn promote(&self, dedupe_key: &str, incoming: &NewJob) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "SELECT id, payload FROM job_queue
             WHERE dedupe_key = $1 AND status IN ('pending', 'processing')
             FOR UPDATE",
        )
        .bind(dedupe_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(None);
        };

        let job_id: Uuid = row.get("id");
        let existing: JsonValue = row.get("payload");
        let merged = promote_payload(&existing, &incoming.payload);

        sqlx::query(
            "UPDATE job_queue
             SET payload = COALESCE($2, payload),
                 priority = CASE WHEN status = 'pending' THEN GREATEST(priority, $3) ELSE priority END
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(&merged)
        .bind(incoming.priority)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "jobs",
            op = "promote",
            job_id = %job_id,
            dedupe_key,
            payload_changed = merged.is_some(),
            "Promoted live job"
        );
        Ok(Some(job_id))
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, ctx: &RequestContext, job: &NewJob) -> Result<EnqueueOutcome> {
        let scheduled_at = job.scheduled_at.unwrap_or_else(Utc::now);

        for attempt in 1..=defaults::ENQUEUE_CONFLICT_RETRIES {
            let job_id = Uuid::now_v7();
            let inserted: Option<Uuid> = sqlx::query_scalar(
                "INSERT INTO job_queue
                     (id, task_type, payload, status, priority, dedupe_key, max_attempts,
                      tenant_id, org_id, created_by, scheduled_at, created_at)
                 VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (dedupe_key) WHERE status IN ('pending', 'processing') DO NOTHING
                 RETURNING id",
            )
            .bind(job_id)
            .bind(&job.task_type)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(&job.dedupe_key)
            .bind(job.max_attempts)
            .bind(&ctx.tenant_id)
            .bind(&ctx.org_id)
            .bind(&ctx.user_id)
            .bind(scheduled_at)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

            if let Some(job_id) = inserted {
                return Ok(EnqueueOutcome {
                    job_id,
                    promoted: false,
                });
            }

            let Some(key) = job.dedupe_key.as_deref() else {
                return Err(Error::Internal(
                    "insert without dedupe key returned no row".to_string(),
                ));
            };

            if let Some(existing) = self.promote(key, job).await? {
                return Ok(EnqueueOutcome {
                    job_id: existing,
                    promoted: true,
                });
            }

            warn!(
                subsystem = "db",
                component = "jobs",
                op = "enqueue",
                dedupe_key = key,
                attempt,
                "Live job vanished during promotion, retrying insert"
            );
        }

        Err(Error::Job(format!(
            "enqueue contention on dedupe key {:?} after {} attempts",
            job.dedupe_key,
            defaults::ENQUEUE_CONFLICT_RETRIES
        )))
    }

    async fn dequeue(&self, worker_id: &str, task_types: &[String]) -> Result<Option<Job>> {
        let now = Utc::now();

        // Single statement: the row lock taken by the subquery makes the
        // claim exclusive and SKIP LOCKED keeps concurrent callers moving.
        let query = format!(
            "UPDATE job_queue
             SET status = 'processing', worker_id = $1, started_at = $2,
                 completed_at = NULL, attempt_count = attempt_count + 1
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status = 'pending'
                   AND scheduled_at <= $2
                   AND (cardinality($3::text[]) = 0 OR task_type = ANY($3))
                 ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(worker_id)
            .bind(now)
            .bind(task_types)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE job_queue
             SET status = 'completed', completed_at = $2,
                 payload = CASE WHEN $3::jsonb IS NULL THEN payload
                                ELSE jsonb_set(payload, '{result}', $3::jsonb, true) END
             WHERE id = $1 AND status = 'processing' AND worker_id = $4",
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(&result)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if rows == 0 {
            return Err(self.transition_error(job_id, worker_id, "complete").await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: &JobFailure,
        retry_delay: Duration,
    ) -> Result<JobStatus> {
        let now = Utc::now();
        let retry_at = now.checked_add_signed(retry_delay).unwrap_or(now);

        // The retry decision and the transition happen in one statement so a
        // concurrent reclaim or duplicate report cannot interleave.
        let row = sqlx::query(
            "UPDATE job_queue
             SET status = CASE WHEN $2 AND attempt_count < max_attempts
                               THEN 'pending' ELSE 'failed' END,
                 scheduled_at = CASE WHEN $2 AND attempt_count < max_attempts
                                     THEN $3 ELSE scheduled_at END,
                 completed_at = CASE WHEN $2 AND attempt_count < max_attempts
                                     THEN NULL ELSE $4 END,
                 last_error = $5,
                 error_code = $6
             WHERE id = $1 AND status = 'processing' AND worker_id = $7
             RETURNING status",
        )
        .bind(job_id)
        .bind(failure.retryable)
        .bind(retry_at)
        .bind(now)
        .bind(&failure.message)
        .bind(&failure.code)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Err(self.transition_error(job_id, worker_id, "fail").await);
        };
        let status: String = row.get("status");
        JobStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown job status in store: {status}")))
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE job_queue
             SET status = 'pending',
                 last_error = 'stale lease reclaimed from ' || COALESCE(worker_id, 'unknown worker'),
                 error_code = 'stale'
             WHERE status = 'processing' AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if rows > 0 {
            warn!(
                subsystem = "db",
                component = "jobs",
                op = "reclaim_stale",
                rows,
                cutoff = %cutoff,
                "Reclaimed stale jobs"
            );
        }
        Ok(rows)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE job_queue
             SET status = 'cancelled', completed_at = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        // LIMIT NULL means no limit in Postgres.
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM job_queue
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR task_type = $2)
               AND ($3::text IS NULL OR dedupe_key = $3)
               AND ($4::text IS NULL OR payload->>'batch_id' = $4)
             ORDER BY created_at DESC, id DESC
             LIMIT $5 OFFSET $6"
        );

        let rows = sqlx::query(&query)
            .bind(filter.status.map(JobStatus::as_str))
            .bind(&filter.task_type)
            .bind(&filter.dedupe_key)
            .bind(filter.batch_id.map(|id| id.to_string()))
            .bind(filter.limit)
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

/// Error for a `complete`/`fail` call that did not match a leased row.
///
/// A job still `processing` under another worker id was reclaimed and
/// leased again; the caller no longer owns it.
pub(crate) fn lease_error(job: &Job, worker_id: &str, op: &str) -> Error {
    match job.worker_id.as_deref() {
        Some(holder) if job.status == JobStatus::Processing && holder != worker_id => {
            Error::Job(format!(
                "cannot {op} job {}: lease is held by {holder}, not {worker_id}",
                job.id
            ))
        }
        _ => Error::Job(format!("cannot {op} job {} in status {}", job.id, job.status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leased_job(worker_id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            task_type: "similarity_match".to_string(),
            payload: json!({}),
            status: JobStatus::Processing,
            priority: 0,
            dedupe_key: None,
            worker_id: Some(worker_id.to_string()),
            attempt_count: 1,
            max_attempts: 3,
            last_error: None,
            error_code: None,
            tenant_id: None,
            org_id: None,
            created_by: None,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
        }
    }

    #[test]
    fn test_lease_error_names_current_holder() {
        let err = lease_error(&leased_job("w-b"), "w-a", "fail");
        let message = err.to_string();
        assert!(message.contains("held by w-b"), "{message}");
        assert!(message.contains("not w-a"), "{message}");
    }

    #[test]
    fn test_lease_error_reports_status_when_not_processing() {
        let mut job = leased_job("w-a");
        job.status = JobStatus::Completed;
        let message = lease_error(&job, "w-a", "complete").to_string();
        assert!(message.contains("in status completed"), "{message}");
    }
}
