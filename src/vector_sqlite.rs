//! Local SQLite [`VectorStore`].
//!
//! Vectors are stored as little-endian f32 BLOBs next to the chunk text and
//! citation attributes. Similarity search loads every vector and ranks by
//! cosine similarity in Rust, which is adequate for a few thousand pages of
//! reports.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use report_chat_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use report_chat_core::models::{Chunk, RetrievedDocument};
use report_chat_core::store::VectorStore;

use crate::db;
use crate::migrate;

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open the vector database at `path` and ensure its schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::create_vector_schema(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add_chunks(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, source_id, file, page, chunk_index, text, hash, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    source_id = excluded.source_id,
                    file = excluded.file,
                    page = excluded.page,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    hash = excluded.hash,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source_id)
            .bind(&chunk.file)
            .bind(chunk.page)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.hash)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for sid in source_ids {
            removed += sqlx::query("DELETE FROM chunk_vectors WHERE source_id = ?")
                .bind(sid)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, source_id, file, page, chunk_index, text, hash, embedding
            FROM chunk_vectors
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(f64, Chunk)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                let chunk = Chunk {
                    id: row.get("chunk_id"),
                    source_id: row.get("source_id"),
                    file: row.get("file"),
                    page: row.get("page"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("text"),
                    hash: row.get("hash"),
                };
                (similarity, chunk)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (score, chunk))| RetrievedDocument { chunk, rank, score })
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}
