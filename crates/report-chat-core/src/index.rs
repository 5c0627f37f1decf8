//! Index reconciliation engine.
//!
//! Diffs the chunks produced by the current ingestion pass against the
//! [`IndexRecord`]s persisted by earlier passes and applies the minimal set
//! of vector-store and record-store mutations:
//!
//! | Prior record | Group hash | Action |
//! |--------------|------------|--------|
//! | none | n/a | embed, store, write record (`added`) |
//! | present | differs | embed, delete old vectors, store, write record (`updated`) |
//! | present | equal | touch the record's batch id (`skipped`) |
//! | only in store | n/a | delete vectors + record, `full` mode only (`deleted`) |
//!
//! The unit of reconciliation is the **source group**: every chunk sharing a
//! `source_id`. A group is replaced as a whole, so a stale and a fresh vector
//! never coexist under one `source_id`.
//!
//! A group whose embedding or storage fails is reported in
//! [`IndexStats::failures`]; earlier groups stay committed. A group that
//! fails before its old vectors are deleted keeps them and its record. A
//! group that fails after the delete also loses its record, so the next pass
//! adds it again whatever its content. Because unchanged groups are skipped
//! by hash, re-running the same pass resumes where the failed one stopped.
//!
//! Files listed in [`IndexOptions::preserve_files`] (reports that could not
//! be loaded this pass) keep their records and vectors under `full` cleanup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::models::{Chunk, IndexRecord};
use crate::store::{RecordManager, VectorStore};

/// How records absent from the current pass are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Delete every record (and its vectors) not seen in this pass.
    Full,
    /// Never delete; only add and update.
    Incremental,
}

impl FromStr for CleanupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(CleanupMode::Full),
            "incremental" => Ok(CleanupMode::Incremental),
            other => bail!(
                "Unknown cleanup mode: '{}'. Available: full, incremental",
                other
            ),
        }
    }
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupMode::Full => write!(f, "full"),
            CleanupMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Parameters for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Record namespace, `"{provider}/{index_name}"`.
    pub namespace: String,
    pub cleanup: CleanupMode,
    /// Maximum number of texts per embedding request.
    pub batch_size: usize,
    /// Files whose groups are never treated as stale, even when none of
    /// their chunks were seen.
    pub preserve_files: Vec<String>,
}

impl IndexOptions {
    pub fn new(namespace: impl Into<String>, cleanup: CleanupMode, batch_size: usize) -> Self {
        Self {
            namespace: namespace.into(),
            cleanup,
            batch_size,
            preserve_files: Vec::new(),
        }
    }

    /// Whether `source_id` (`"{file}_{page}"`) belongs to a preserved file.
    fn is_preserved(&self, source_id: &str) -> bool {
        self.preserve_files.iter().any(|file| {
            source_id
                .strip_prefix(file.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|page| page.parse::<i64>().is_ok())
        })
    }
}

/// A source group whose mutation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexFailure {
    pub source_id: String,
    pub error: String,
}

/// Outcome of a reconciliation pass. Counts are in chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    pub failures: Vec<IndexFailure>,
}

/// All chunks of one `source_id`, in chunk order.
#[derive(Debug, Clone)]
pub struct SourceGroup<'a> {
    pub source_id: &'a str,
    pub chunks: Vec<&'a Chunk>,
    pub hash: String,
}

/// What a pass would do, computed without mutating anything.
#[derive(Debug, Default)]
pub struct IndexPlan<'a> {
    pub to_add: Vec<SourceGroup<'a>>,
    pub to_update: Vec<SourceGroup<'a>>,
    pub to_skip: Vec<SourceGroup<'a>>,
    /// Stale records, populated in `full` mode only.
    pub to_delete: Vec<IndexRecord>,
}

impl IndexPlan<'_> {
    /// Chunk-level counts this plan would report if every mutation succeeded.
    pub fn projected_stats(&self) -> IndexStats {
        let count = |groups: &[SourceGroup<'_>]| -> u64 {
            groups.iter().map(|g| g.chunks.len() as u64).sum()
        };
        IndexStats {
            added: count(&self.to_add),
            updated: count(&self.to_update),
            skipped: count(&self.to_skip),
            deleted: self
                .to_delete
                .iter()
                .map(|r| r.chunk_count.max(0) as u64)
                .sum(),
            failed: 0,
            failures: Vec::new(),
        }
    }
}

/// SHA-256 over the ordered chunk hashes of a group.
pub fn group_hash(chunks: &[&Chunk]) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c.hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Group chunks by `source_id`, preserving first-occurrence order.
pub fn group_chunks(chunks: &[Chunk]) -> Vec<SourceGroup<'_>> {
    let mut order: Vec<&str> = Vec::new();
    let mut by_source: HashMap<&str, Vec<&Chunk>> = HashMap::new();
    for c in chunks {
        by_source
            .entry(c.source_id.as_str())
            .or_insert_with(|| {
                order.push(c.source_id.as_str());
                Vec::new()
            })
            .push(c);
    }

    order
        .into_iter()
        .filter_map(|sid| {
            let mut group = by_source.remove(sid)?;
            group.sort_by_key(|c| c.chunk_index);
            Some(SourceGroup {
                source_id: sid,
                hash: group_hash(&group),
                chunks: group,
            })
        })
        .collect()
}

/// Diff the current chunks against the persisted records of `opts.namespace`.
pub async fn plan_index<'a>(
    chunks: &'a [Chunk],
    records: &dyn RecordManager,
    opts: &IndexOptions,
) -> Result<IndexPlan<'a>> {
    let existing: HashMap<String, IndexRecord> = records
        .list(&opts.namespace)
        .await?
        .into_iter()
        .map(|r| (r.source_id.clone(), r))
        .collect();

    let mut plan = IndexPlan::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for group in group_chunks(chunks) {
        seen.insert(group.source_id);
        match existing.get(group.source_id) {
            None => plan.to_add.push(group),
            Some(rec) if rec.content_hash != group.hash => plan.to_update.push(group),
            Some(_) => plan.to_skip.push(group),
        }
    }

    if opts.cleanup == CleanupMode::Full {
        let mut stale: Vec<IndexRecord> = existing
            .into_values()
            .filter(|r| !seen.contains(r.source_id.as_str()))
            .filter(|r| !opts.is_preserved(&r.source_id))
            .collect();
        stale.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        plan.to_delete = stale;
    }

    Ok(plan)
}

/// Run one reconciliation pass and apply it.
///
/// Returns `Err` only when the record store cannot be listed or the stale
/// cleanup fails; per-group failures are reported in the stats.
pub async fn index_chunks(
    chunks: &[Chunk],
    vectors: &dyn VectorStore,
    records: &dyn RecordManager,
    embedder: &dyn EmbeddingProvider,
    opts: &IndexOptions,
) -> Result<IndexStats> {
    let plan = plan_index(chunks, records, opts).await?;
    let batch_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let mut stats = IndexStats::default();

    // Unchanged groups
    let skip_ids: Vec<String> = plan.to_skip.iter().map(|g| g.source_id.to_string()).collect();
    if !skip_ids.is_empty() {
        records
            .touch(&opts.namespace, &skip_ids, &batch_id, now)
            .await?;
    }
    stats.skipped = plan.to_skip.iter().map(|g| g.chunks.len() as u64).sum();

    // New and changed groups, embedded in batches that may span groups
    let mut writes: Vec<PendingWrite<'_, '_>> = Vec::new();
    writes.extend(plan.to_add.iter().map(|g| (g, false)));
    writes.extend(plan.to_update.iter().map(|g| (g, true)));

    let batch_size = opts.batch_size.max(1);
    let mut pending: Vec<PendingWrite<'_, '_>> = Vec::new();
    let mut pending_texts = 0usize;
    for entry in writes {
        pending_texts += entry.0.chunks.len();
        pending.push(entry);
        if pending_texts >= batch_size {
            let ctx = WriteContext {
                vectors,
                records,
                embedder,
                namespace: &opts.namespace,
                batch_id: &batch_id,
                now,
                batch_size,
            };
            ctx.flush(&pending, &mut stats).await;
            pending.clear();
            pending_texts = 0;
        }
    }
    if !pending.is_empty() {
        let ctx = WriteContext {
            vectors,
            records,
            embedder,
            namespace: &opts.namespace,
            batch_id: &batch_id,
            now,
            batch_size,
        };
        ctx.flush(&pending, &mut stats).await;
    }

    // Stale groups
    if !plan.to_delete.is_empty() {
        let stale_ids: Vec<String> = plan.to_delete.iter().map(|r| r.source_id.clone()).collect();
        vectors.delete_sources(&stale_ids).await?;
        records.delete(&opts.namespace, &stale_ids).await?;
        stats.deleted = plan
            .to_delete
            .iter()
            .map(|r| r.chunk_count.max(0) as u64)
            .sum();
    }

    Ok(stats)
}

struct WriteContext<'a> {
    vectors: &'a dyn VectorStore,
    records: &'a dyn RecordManager,
    embedder: &'a dyn EmbeddingProvider,
    namespace: &'a str,
    batch_id: &'a str,
    now: i64,
    batch_size: usize,
}

type PendingWrite<'g, 'c> = (&'g SourceGroup<'c>, bool);

fn texts_of(groups: &[PendingWrite<'_, '_>]) -> Vec<String> {
    groups
        .iter()
        .flat_map(|(g, _)| g.chunks.iter().map(|c| c.content.clone()))
        .collect()
}

impl WriteContext<'_> {
    async fn flush(&self, groups: &[PendingWrite<'_, '_>], stats: &mut IndexStats) {
        match self.embed_all(&texts_of(groups)).await {
            Ok(embedded) => self.write_all(groups, &embedded, stats).await,
            Err(e) if groups.len() == 1 => record_failure(stats, groups[0].0, &e),
            Err(_) => {
                // The batch mixed groups: embed each on its own so only the
                // group with the offending text fails.
                for entry in groups {
                    let one = std::slice::from_ref(entry);
                    match self.embed_all(&texts_of(one)).await {
                        Ok(embedded) => self.write_all(one, &embedded, stats).await,
                        Err(e) => record_failure(stats, entry.0, &e),
                    }
                }
            }
        }
    }

    async fn write_all(
        &self,
        groups: &[PendingWrite<'_, '_>],
        embedded: &[Vec<f32>],
        stats: &mut IndexStats,
    ) {
        let mut offset = 0usize;
        for (group, is_update) in groups {
            let n = group.chunks.len();
            let group_vectors = &embedded[offset..offset + n];
            offset += n;

            match self.write_group(group, group_vectors).await {
                Ok(()) if *is_update => stats.updated += n as u64,
                Ok(()) => stats.added += n as u64,
                Err(e) => record_failure(stats, group, &e),
            }
        }
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vecs = self.embedder.embed(batch).await?;
            if vecs.len() != batch.len() {
                bail!(
                    "embedding provider returned {} vectors for {} texts",
                    vecs.len(),
                    batch.len()
                );
            }
            out.extend(vecs);
        }
        Ok(out)
    }

    async fn write_group(&self, group: &SourceGroup<'_>, vecs: &[Vec<f32>]) -> Result<()> {
        let source_ids = [group.source_id.to_string()];
        // Also clears vectors left behind by an interrupted earlier pass.
        self.vectors.delete_sources(&source_ids).await?;

        match self.store_group(group, vecs).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The old vectors are gone; without its record the group is
                // re-added on the next pass even if its content reverts.
                match self.records.delete(self.namespace, &source_ids).await {
                    Ok(()) => Err(e),
                    Err(cleanup) => Err(e.context(format!(
                        "record for {} could not be dropped: {:#}",
                        group.source_id, cleanup
                    ))),
                }
            }
        }
    }

    async fn store_group(&self, group: &SourceGroup<'_>, vecs: &[Vec<f32>]) -> Result<()> {
        let owned: Vec<Chunk> = group.chunks.iter().map(|c| (*c).clone()).collect();
        self.vectors.add_chunks(&owned, vecs).await?;

        self.records
            .upsert(&IndexRecord {
                namespace: self.namespace.to_string(),
                source_id: group.source_id.to_string(),
                content_hash: group.hash.clone(),
                chunk_count: owned.len() as i64,
                batch_id: self.batch_id.to_string(),
                updated_at: self.now,
            })
            .await
    }
}

fn record_failure(stats: &mut IndexStats, group: &SourceGroup<'_>, err: &anyhow::Error) {
    stats.failed += group.chunks.len() as u64;
    stats.failures.push(IndexFailure {
        source_id: group.source_id.to_string(),
        error: format!("{:#}", err),
    });
}
