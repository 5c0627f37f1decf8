//! SQLite-backed [`RecordManager`].

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use report_chat_core::models::IndexRecord;
use report_chat_core::store::RecordManager;

use crate::db;
use crate::migrate;

pub struct SqliteRecordManager {
    pool: SqlitePool,
}

impl SqliteRecordManager {
    /// Open the record store at `url` and ensure its schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = db::connect_url(url).await?;
        migrate::create_record_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordManager for SqliteRecordManager {
    async fn list(&self, namespace: &str) -> Result<Vec<IndexRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, source_id, content_hash, chunk_count, batch_id, updated_at
            FROM index_records
            WHERE namespace = ?
            ORDER BY source_id
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| IndexRecord {
                namespace: row.get("namespace"),
                source_id: row.get("source_id"),
                content_hash: row.get("content_hash"),
                chunk_count: row.get("chunk_count"),
                batch_id: row.get("batch_id"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_records (namespace, source_id, content_hash, chunk_count, batch_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, source_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                batch_id = excluded.batch_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.namespace)
        .bind(&record.source_id)
        .bind(&record.content_hash)
        .bind(record.chunk_count)
        .bind(&record.batch_id)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(
        &self,
        namespace: &str,
        source_ids: &[String],
        batch_id: &str,
        updated_at: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sid in source_ids {
            sqlx::query(
                "UPDATE index_records SET batch_id = ?, updated_at = ? WHERE namespace = ? AND source_id = ?",
            )
            .bind(batch_id)
            .bind(updated_at)
            .bind(namespace)
            .bind(sid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, source_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sid in source_ids {
            sqlx::query("DELETE FROM index_records WHERE namespace = ? AND source_id = ?")
                .bind(namespace)
                .bind(sid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
