//! Dedup batch repository.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use pairwise_core::{BatchRepository, BatchScope, BatchStatus, DedupBatch, Error, Result};

const BATCH_COLUMNS: &str = "id, name, scope, rule_id, status, jobs_spawned, total_files, \
     processed_files, found_similarities, summary, error_message, created_by, started_at, \
     completed_at, created_at";

/// PostgreSQL implementation of BatchRepository.
#[derive(Clone)]
pub struct PgBatchRepository {
    pool: Pool<Postgres>,
}

impl PgBatchRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_batch_row(row: sqlx::postgres::PgRow) -> Result<DedupBatch> {
        let status: String = row.get("status");
        let status = BatchStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown batch status: {status}")))?;
        let scope: JsonValue = row.get("scope");
        let scope: BatchScope = serde_json::from_value(scope)?;
        Ok(DedupBatch {
            id: row.get("id"),
            name: row.get("name"),
            scope,
            rule_id: row.get("rule_id"),
            status,
            jobs_spawned: row.get("jobs_spawned"),
            total_files: row.get("total_files"),
            processed_files: row.get("processed_files"),
            found_similarities: row.get("found_similarities"),
            summary: row.get("summary"),
            error_message: row.get("error_message"),
            created_by: row.get("created_by"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl BatchRepository for PgBatchRepository {
    async fn insert(&self, batch: &DedupBatch) -> Result<()> {
        sqlx::query(
            "INSERT INTO dedup_batches
                 (id, name, scope, rule_id, status, jobs_spawned, total_files, processed_files,
                  found_similarities, summary, error_message, created_by, started_at,
                  completed_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(serde_json::to_value(&batch.scope)?)
        .bind(batch.rule_id)
        .bind(batch.status.as_str())
        .bind(batch.jobs_spawned)
        .bind(batch.total_files)
        .bind(batch.processed_files)
        .bind(batch.found_similarities)
        .bind(&batch.summary)
        .bind(&batch.error_message)
        .bind(&batch.created_by)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(batch.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn update(&self, batch: &DedupBatch) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE dedup_batches
             SET status = $2, jobs_spawned = $3, total_files = $4, processed_files = $5,
                 found_similarities = $6, summary = $7, error_message = $8,
                 started_at = $9, completed_at = $10
             WHERE id = $1",
        )
        .bind(batch.id)
        .bind(batch.status.as_str())
        .bind(batch.jobs_spawned)
        .bind(batch.total_files)
        .bind(batch.processed_files)
        .bind(batch.found_similarities)
        .bind(&batch.summary)
        .bind(&batch.error_message)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if rows == 0 {
            return Err(Error::BatchNotFound(batch.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DedupBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM dedup_batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_batch_row).transpose()
    }

    async fn list(&self, limit: i64) -> Result<Vec<DedupBatch>> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM dedup_batches
             ORDER BY created_at DESC, id DESC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_batch_row).collect()
    }
}
