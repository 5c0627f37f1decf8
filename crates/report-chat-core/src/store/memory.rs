//! In-memory [`VectorStore`] and [`RecordManager`] implementations.
//!
//! Uses `Vec` and `HashMap` behind `std::sync::RwLock`. Similarity search is
//! brute-force cosine similarity over every stored vector.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, IndexRecord, RetrievedDocument};

use super::{RecordManager, VectorStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

struct StoredVector {
    chunk: Chunk,
    vector: Vec<f32>,
}

/// In-memory vector store for tests and embedded callers.
#[derive(Default)]
pub struct InMemoryVectorStore {
    vectors: RwLock<Vec<StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored chunks for one source group, in insertion order.
    pub fn chunks_for(&self, source_id: &str) -> Result<Vec<Chunk>> {
        Ok(read(&self.vectors)?
            .iter()
            .filter(|sv| sv.chunk.source_id == source_id)
            .map(|sv| sv.chunk.clone())
            .collect())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add_chunks(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let mut stored = write(&self.vectors)?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            stored.retain(|sv| sv.chunk.id != chunk.id);
            stored.push(StoredVector {
                chunk: chunk.clone(),
                vector: vector.clone(),
            });
        }
        Ok(())
    }

    async fn delete_sources(&self, source_ids: &[String]) -> Result<u64> {
        let ids: HashSet<&str> = source_ids.iter().map(String::as_str).collect();
        let mut stored = write(&self.vectors)?;
        let before = stored.len();
        stored.retain(|sv| !ids.contains(sv.chunk.source_id.as_str()));
        Ok((before - stored.len()) as u64)
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        let stored = read(&self.vectors)?;
        let mut scored: Vec<(f64, &Chunk)> = stored
            .iter()
            .map(|sv| (cosine_similarity(query_vec, &sv.vector) as f64, &sv.chunk))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (score, chunk))| RetrievedDocument {
                chunk: chunk.clone(),
                rank,
                score,
            })
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(read(&self.vectors)?.len() as u64)
    }
}

/// In-memory record manager keyed by `(namespace, source_id)`.
#[derive(Default)]
pub struct InMemoryRecordManager {
    records: RwLock<HashMap<(String, String), IndexRecord>>,
}

impl InMemoryRecordManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordManager for InMemoryRecordManager {
    async fn list(&self, namespace: &str) -> Result<Vec<IndexRecord>> {
        let mut out: Vec<IndexRecord> = read(&self.records)?
            .values()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        write(&self.records)?.insert(
            (record.namespace.clone(), record.source_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn touch(
        &self,
        namespace: &str,
        source_ids: &[String],
        batch_id: &str,
        updated_at: i64,
    ) -> Result<()> {
        let mut records = write(&self.records)?;
        for sid in source_ids {
            if let Some(r) = records.get_mut(&(namespace.to_string(), sid.clone())) {
                r.batch_id = batch_id.to_string();
                r.updated_at = updated_at;
            }
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, source_ids: &[String]) -> Result<()> {
        let mut records = write(&self.records)?;
        for sid in source_ids {
            records.remove(&(namespace.to_string(), sid.clone()));
        }
        Ok(())
    }
}
