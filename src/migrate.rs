//! Idempotent schema creation for the SQLite backends.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::vector_weaviate::WeaviateVectorStore;

/// Create every table the configured backends need (`report-chat init`).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let records = db::connect_url(&config.record_store.url).await?;
    create_record_schema(&records).await?;
    records.close().await;

    match config.vector_store.provider.as_str() {
        "sqlite" => {
            let vectors = db::connect_path(&config.vector_store.path).await?;
            create_vector_schema(&vectors).await?;
            vectors.close().await;
        }
        "weaviate" => {
            WeaviateVectorStore::new(&config.vector_store)?
                .ensure_schema()
                .await?;
        }
        _ => {}
    }

    Ok(())
}

/// Index bookkeeping: one row per `(namespace, source_id)`.
pub async fn create_record_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_records (
            namespace TEXT NOT NULL,
            source_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            batch_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_records_batch ON index_records(namespace, batch_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Local vector store: chunk text, citation attributes, and f32 BLOB vectors.
pub async fn create_vector_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            file TEXT NOT NULL,
            page INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_source ON chunk_vectors(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}
