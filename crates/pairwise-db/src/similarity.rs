//! Similarity record repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use pairwise_core::{
    DayCount, Error, RecordOrder, RecordSummary, ResolvedRecordFilter, Result, ReviewUpdate,
    SimilarityRecord, SimilarityRepository, SimilarityStatus,
};

const RECORD_COLUMNS: &str = "id, source_file_id, target_file_id, pair_key, score, status, \
     rule_id, batch_id, detection_mode, detection_params, reviewed_by, review_note, \
     reviewed_at, workflow_process_id, created_at";

/// Shared WHERE clause for report and export queries. Binds `$1..=$5`.
const FILTER_CLAUSE: &str = "created_at >= $1 AND created_at <= $2
       AND ($3::text IS NULL OR status = $3)
       AND ($4::uuid IS NULL OR rule_id = $4)
       AND ($5::uuid IS NULL OR batch_id = $5)";

/// PostgreSQL implementation of SimilarityRepository.
#[derive(Clone)]
pub struct PgSimilarityRepository {
    pool: Pool<Postgres>,
}

impl PgSimilarityRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: sqlx::postgres::PgRow) -> Result<SimilarityRecord> {
        let status: String = row.get("status");
        let status = SimilarityStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown similarity status: {status}")))?;
        Ok(SimilarityRecord {
            id: row.get("id"),
            source_file_id: row.get("source_file_id"),
            target_file_id: row.get("target_file_id"),
            pair_key: row.get("pair_key"),
            score: row.get("score"),
            status,
            rule_id: row.get("rule_id"),
            batch_id: row.get("batch_id"),
            detection_mode: row.get("detection_mode"),
            detection_params: row.get("detection_params"),
            reviewed_by: row.get("reviewed_by"),
            review_note: row.get("review_note"),
            reviewed_at: row.get("reviewed_at"),
            workflow_process_id: row.get("workflow_process_id"),
            created_at: row.get("created_at"),
        })
    }

    /// Run a `(key, count)` aggregation over the filtered set.
    async fn grouped_counts(
        &self,
        key_expr: &str,
        filter: &ResolvedRecordFilter,
    ) -> Result<Vec<(Option<String>, i64)>> {
        let query = format!(
            "SELECT {key_expr} AS key, COUNT(*) AS n FROM similarity_records
             WHERE {FILTER_CLAUSE}
             GROUP BY 1 ORDER BY 1"
        );
        let rows = sqlx::query(&query)
            .bind(filter.start)
            .bind(filter.end)
            .bind(filter.status.map(SimilarityStatus::as_str))
            .bind(filter.rule_id)
            .bind(filter.batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<Option<String>, _>("key"), row.get("n")))
            .collect())
    }
}

#[async_trait]
impl SimilarityRepository for PgSimilarityRepository {
    async fn insert_if_absent(&self, record: &SimilarityRecord) -> Result<bool> {
        let rows = sqlx::query(
            "INSERT INTO similarity_records
                 (id, source_file_id, target_file_id, pair_key, score, status, rule_id,
                  batch_id, detection_mode, detection_params, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (pair_key) DO NOTHING",
        )
        .bind(record.id)
        .bind(&record.source_file_id)
        .bind(&record.target_file_id)
        .bind(&record.pair_key)
        .bind(record.score)
        .bind(record.status.as_str())
        .bind(record.rule_id)
        .bind(record.batch_id)
        .bind(&record.detection_mode)
        .bind(&record.detection_params)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimilarityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM similarity_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_record_row).transpose()
    }

    async fn get_by_pair_key(&self, pair_key: &str) -> Result<Option<SimilarityRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM similarity_records WHERE pair_key = $1"
        ))
        .bind(pair_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_record_row).transpose()
    }

    async fn apply_review(
        &self,
        id: Uuid,
        update: &ReviewUpdate,
    ) -> Result<Option<SimilarityRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE similarity_records
             SET status = $2, reviewed_by = $3, review_note = $4, reviewed_at = $5
             WHERE id = $1
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(id)
        .bind(update.status.as_str())
        .bind(&update.reviewed_by)
        .bind(&update.note)
        .bind(update.reviewed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_record_row).transpose()
    }

    async fn swap_workflow_process(
        &self,
        id: Uuid,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE similarity_records SET workflow_process_id = $3
             WHERE id = $1 AND workflow_process_id IS NOT DISTINCT FROM $2",
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();
        Ok(rows > 0)
    }

    async fn list(
        &self,
        filter: &ResolvedRecordFilter,
        order: RecordOrder,
        limit: usize,
    ) -> Result<Vec<SimilarityRecord>> {
        let order_by = match order {
            RecordOrder::Oldest => "created_at ASC, id ASC",
            RecordOrder::Newest => "created_at DESC, id DESC",
        };
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM similarity_records
             WHERE {FILTER_CLAUSE}
             ORDER BY {order_by}
             LIMIT $6"
        );
        let rows = sqlx::query(&query)
            .bind(filter.start)
            .bind(filter.end)
            .bind(filter.status.map(SimilarityStatus::as_str))
            .bind(filter.rule_id)
            .bind(filter.batch_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_record_row).collect()
    }

    async fn summarize(&self, filter: &ResolvedRecordFilter) -> Result<RecordSummary> {
        let mut summary = RecordSummary::default();

        for (status, n) in self.grouped_counts("status", filter).await? {
            summary.total += n;
            if let Some(status) = status {
                summary.by_status.insert(status, n);
            }
        }
        for (rule, n) in self.grouped_counts("rule_id::text", filter).await? {
            if let Some(rule) = rule {
                summary.by_rule_id.insert(rule, n);
            }
        }
        for (batch, n) in self.grouped_counts("batch_id::text", filter).await? {
            match batch {
                Some(batch) => {
                    summary.by_batch_id.insert(batch, n);
                }
                None => summary.no_batch = n,
            }
        }

        let query = format!(
            "SELECT to_char(created_at AT TIME ZONE 'UTC', 'YYYY-MM-DD') AS day, status,
                    COUNT(*) AS n
             FROM similarity_records
             WHERE {FILTER_CLAUSE}
             GROUP BY 1, 2 ORDER BY 1, 2"
        );
        let rows = sqlx::query(&query)
            .bind(filter.start)
            .bind(filter.end)
            .bind(filter.status.map(SimilarityStatus::as_str))
            .bind(filter.rule_id)
            .bind(filter.batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut days: BTreeMap<String, DayCount> = BTreeMap::new();
        for row in rows {
            let day: String = row.get("day");
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let entry = days.entry(day.clone()).or_insert_with(|| DayCount {
                day,
                ..Default::default()
            });
            entry.total += n;
            entry.by_status.insert(status, n);
        }
        summary.by_day = days.into_values().collect();

        Ok(summary)
    }

    async fn count_for_batch(&self, batch_id: Uuid) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM similarity_records WHERE batch_id = $1")
                .bind(batch_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count)
    }
}
