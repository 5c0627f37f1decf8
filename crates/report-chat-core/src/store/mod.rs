//! Storage abstractions for Report Chat.
//!
//! Two collaborators back the index:
//!
//! - [`VectorStore`] holds chunk text plus embeddings and answers
//!   similarity queries. Vectors are addressed by `source_id` so that a
//!   whole source group can be replaced or removed at once.
//! - [`RecordManager`] holds the [`IndexRecord`] bookkeeping the
//!   reconciliation engine diffs against on every ingestion pass.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! In-memory implementations live in [`memory`]; SQLite and Weaviate
//! backends live in the application crate.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, IndexRecord, RetrievedDocument};

/// Abstract vector store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`add_chunks`](VectorStore::add_chunks) | Store chunks with their vectors |
/// | [`delete_sources`](VectorStore::delete_sources) | Remove every vector of the given source groups |
/// | [`similarity_search`](VectorStore::similarity_search) | Top-k nearest chunks, most similar first |
/// | [`count`](VectorStore::count) | Number of stored vectors |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store `chunks[i]` with embedding `vectors[i]`.
    async fn add_chunks(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()>;

    /// Delete every stored vector whose `source_id` is in `source_ids`.
    ///
    /// Returns the number of vectors removed.
    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64>;

    /// Return at most `k` documents ordered by descending similarity.
    async fn similarity_search(&self, query_vec: &[f32], k: usize)
        -> Result<Vec<RetrievedDocument>>;

    /// Total number of stored vectors.
    async fn count(&self) -> Result<u64>;
}

/// Persisted bookkeeping of indexed source groups, scoped by namespace.
#[async_trait]
pub trait RecordManager: Send + Sync {
    /// All records in `namespace`.
    async fn list(&self, namespace: &str) -> Result<Vec<IndexRecord>>;

    /// Insert or replace the record for `(record.namespace, record.source_id)`.
    async fn upsert(&self, record: &IndexRecord) -> Result<()>;

    /// Mark existing records as seen by `batch_id` without changing content.
    async fn touch(
        &self,
        namespace: &str,
        source_ids: &[String],
        batch_id: &str,
        updated_at: i64,
    ) -> Result<()>;

    /// Remove the records for `source_ids` in `namespace`.
    async fn delete(&self, namespace: &str, source_ids: &[String]) -> Result<()>;
}
