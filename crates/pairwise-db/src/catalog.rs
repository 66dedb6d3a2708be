//! File catalog backed by the `file_catalog` table.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use pairwise_core::{BatchScope, CatalogFile, Error, FileCatalog, Result};

const FILE_COLUMNS: &str = "file_id, filename, item_type, document_type, checksum, created_at";

/// Document type meaning "any type".
pub const ANY_DOCUMENT_TYPE: &str = "all";

/// PostgreSQL implementation of FileCatalog.
#[derive(Clone)]
pub struct PgFileCatalog {
    pool: Pool<Postgres>,
}

impl PgFileCatalog {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert or replace a catalog entry.
    pub async fn upsert(&self, file: &CatalogFile) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_catalog (file_id, filename, item_type, document_type, checksum, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (file_id) DO UPDATE
             SET filename = EXCLUDED.filename, item_type = EXCLUDED.item_type,
                 document_type = EXCLUDED.document_type, checksum = EXCLUDED.checksum",
        )
        .bind(&file.file_id)
        .bind(&file.filename)
        .bind(&file.item_type)
        .bind(&file.document_type)
        .bind(&file.checksum)
        .bind(file.created_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    fn parse_file_row(row: sqlx::postgres::PgRow) -> CatalogFile {
        CatalogFile {
            file_id: row.get("file_id"),
            filename: row.get("filename"),
            item_type: row.get("item_type"),
            document_type: row.get("document_type"),
            checksum: row.get("checksum"),
            created_at: row.get("created_at"),
        }
    }
}

#[async_trait]
impl FileCatalog for PgFileCatalog {
    async fn list_files(
        &self,
        scope: &BatchScope,
        limit: Option<usize>,
    ) -> Result<Vec<CatalogFile>> {
        let limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));

        let mut item_type: Option<&str> = None;
        let mut document_type: Option<&str> = None;
        let mut file_ids: Option<&[String]> = None;
        match scope {
            BatchScope::All => {}
            BatchScope::FileList { file_ids: ids } => file_ids = Some(ids.as_slice()),
            BatchScope::ItemType { item_type: t } => item_type = Some(t.as_str()),
            BatchScope::DocumentType { document_type: t } if t != ANY_DOCUMENT_TYPE => {
                document_type = Some(t.as_str())
            }
            BatchScope::DocumentType { .. } => {}
        }

        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM file_catalog
             WHERE ($1::text IS NULL OR item_type = $1)
               AND ($2::text IS NULL OR document_type = $2)
               AND ($3::text[] IS NULL OR file_id = ANY($3))
             ORDER BY file_id ASC
             LIMIT $4"
        ))
        .bind(item_type)
        .bind(document_type)
        .bind(file_ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_file_row).collect())
    }

    async fn get_file(&self, file_id: &str) -> Result<Option<CatalogFile>> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM file_catalog WHERE file_id = $1"
        ))
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_file_row))
    }

    async fn find_by_checksum(&self, checksum: &str) -> Result<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT file_id FROM file_catalog WHERE checksum = $1 ORDER BY file_id LIMIT 1",
        )
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }
}
