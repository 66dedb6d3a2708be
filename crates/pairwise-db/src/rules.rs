//! Dedup rule repository.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use pairwise_core::{DedupRule, Error, Result, RuleRepository};

const RULE_COLUMNS: &str = "id, name, description, item_type, document_type, threshold, \
     phash_threshold, feature_threshold, mode, auto_trigger_workflow, workflow_map_id, \
     priority, is_active, created_by, created_at, updated_at";

/// PostgreSQL implementation of RuleRepository.
#[derive(Clone)]
pub struct PgRuleRepository {
    pool: Pool<Postgres>,
}

impl PgRuleRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_rule_row(row: sqlx::postgres::PgRow) -> DedupRule {
        DedupRule {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            item_type: row.get("item_type"),
            document_type: row.get("document_type"),
            threshold: row.get("threshold"),
            phash_threshold: row.get("phash_threshold"),
            feature_threshold: row.get("feature_threshold"),
            mode: row.get("mode"),
            auto_trigger_workflow: row.get("auto_trigger_workflow"),
            workflow_map_id: row.get("workflow_map_id"),
            priority: row.get("priority"),
            is_active: row.get("is_active"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// Map a duplicate rule name to an input error.
fn map_write_error(err: sqlx::Error, name: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::InvalidInput(format!("dedup rule name already exists: {name}"))
        }
        sqlx::Error::Database(db) if db.is_check_violation() => {
            Error::Config("auto_trigger_workflow requires workflow_map_id".to_string())
        }
        _ => Error::Database(err),
    }
}

#[async_trait]
impl RuleRepository for PgRuleRepository {
    async fn insert(&self, rule: &DedupRule) -> Result<()> {
        sqlx::query(
            "INSERT INTO dedup_rules
                 (id, name, description, item_type, document_type, threshold, phash_threshold,
                  feature_threshold, mode, auto_trigger_workflow, workflow_map_id, priority,
                  is_active, created_by, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.item_type)
        .bind(&rule.document_type)
        .bind(rule.threshold)
        .bind(rule.phash_threshold)
        .bind(rule.feature_threshold)
        .bind(&rule.mode)
        .bind(rule.auto_trigger_workflow)
        .bind(&rule.workflow_map_id)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(&rule.created_by)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &rule.name))?;
        Ok(())
    }

    async fn update(&self, rule: &DedupRule) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE dedup_rules
             SET name = $2, description = $3, item_type = $4, document_type = $5,
                 threshold = $6, phash_threshold = $7, feature_threshold = $8, mode = $9,
                 auto_trigger_workflow = $10, workflow_map_id = $11, priority = $12,
                 is_active = $13, updated_at = $14
             WHERE id = $1",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.item_type)
        .bind(&rule.document_type)
        .bind(rule.threshold)
        .bind(rule.phash_threshold)
        .bind(rule.feature_threshold)
        .bind(&rule.mode)
        .bind(rule.auto_trigger_workflow)
        .bind(&rule.workflow_map_id)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &rule.name))?
        .rows_affected();

        if rows == 0 {
            return Err(Error::RuleNotFound(rule.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DedupRule>> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM dedup_rules WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(Self::parse_rule_row))
    }

    async fn list(&self, active_only: bool) -> Result<Vec<DedupRule>> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM dedup_rules
             WHERE (NOT $1 OR is_active)
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_rule_row).collect())
    }
}
