//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: PDF loader → chunker → index reconciliation
//! → vector store + record store, and prints a summary.

use anyhow::Result;

use report_chat_core::chunk::chunk_segments;
use report_chat_core::embedding::EmbeddingProvider;
use report_chat_core::index::{self, CleanupMode, IndexOptions, IndexStats};
use report_chat_core::store::{RecordManager, VectorStore};

use crate::config::Config;
use crate::embedding;
use crate::loader;
use crate::stores;

/// What an ingestion pass did (or, for a dry run, would do).
#[derive(Debug)]
pub struct IngestReport {
    pub cleanup: CleanupMode,
    pub dry_run: bool,
    pub files_loaded: usize,
    pub files_failed: Vec<(String, String)>,
    pub pages: usize,
    pub chunks: usize,
    pub stats: IndexStats,
}

/// Load, chunk, and reconcile every report against the given backends.
pub async fn ingest_reports(
    config: &Config,
    cleanup: CleanupMode,
    dry_run: bool,
    vectors: &dyn VectorStore,
    records: &dyn RecordManager,
    embedder: &dyn EmbeddingProvider,
) -> Result<IngestReport> {
    let loaded = loader::load_reports(&config.ingest).await?;
    tracing::info!(
        reports = loaded.files_loaded,
        failed = loaded.failures.len(),
        pages = loaded.segments.len(),
        "loaded reports"
    );

    let chunks = chunk_segments(
        &loaded.segments,
        config.chunking.max_tokens,
        config.chunking.overlap_tokens,
    );
    // A report that could not be read this pass keeps what it had indexed.
    let mut opts = IndexOptions::new(
        config.vector_store.namespace(),
        cleanup,
        config.embedding.batch_size,
    );
    opts.preserve_files = loaded.failures.iter().map(|(file, _)| file.clone()).collect();

    let stats = if dry_run {
        index::plan_index(&chunks, records, &opts)
            .await?
            .projected_stats()
    } else {
        index::index_chunks(&chunks, vectors, records, embedder, &opts).await?
    };

    for failure in &stats.failures {
        tracing::warn!(source_id = %failure.source_id, error = %failure.error, "source group not indexed");
    }
    tracing::info!(
        added = stats.added,
        updated = stats.updated,
        skipped = stats.skipped,
        deleted = stats.deleted,
        failed = stats.failed,
        dry_run,
        "indexing finished"
    );

    Ok(IngestReport {
        cleanup,
        dry_run,
        files_loaded: loaded.files_loaded,
        files_failed: loaded.failures,
        pages: loaded.segments.len(),
        chunks: chunks.len(),
        stats,
    })
}

/// `report-chat ingest`: open the configured backends, ingest, print a summary.
pub async fn run_ingest(config: &Config, cleanup: Option<CleanupMode>, dry_run: bool) -> Result<()> {
    let cleanup = match cleanup {
        Some(mode) => mode,
        None => config.ingest.cleanup_mode()?,
    };

    let vectors = stores::open_vector_store(config).await?;
    let records = stores::open_record_manager(config).await?;
    let embedder = embedding::create_provider(&config.embedding)?;

    let report = ingest_reports(
        config,
        cleanup,
        dry_run,
        vectors.as_ref(),
        records.as_ref(),
        embedder.as_ref(),
    )
    .await?;

    print_report(&report);
    if !dry_run {
        println!("  vectors in index: {}", vectors.count().await?);
    }
    if report.stats.failed > 0 {
        println!("completed with {} failed chunks", report.stats.failed);
    } else {
        println!("ok");
    }
    Ok(())
}

fn print_report(report: &IngestReport) {
    if report.dry_run {
        println!("ingest reports (dry-run, cleanup={})", report.cleanup);
    } else {
        println!("ingest reports (cleanup={})", report.cleanup);
    }
    println!("  reports loaded: {}", report.files_loaded);
    for (file, err) in &report.files_failed {
        println!("  report skipped: {} ({})", file, err);
    }
    println!("  pages: {}", report.pages);
    println!("  chunks: {}", report.chunks);
    println!("  added: {}", report.stats.added);
    println!("  updated: {}", report.stats.updated);
    println!("  skipped: {}", report.stats.skipped);
    println!("  deleted: {}", report.stats.deleted);
    if !report.dry_run {
        println!("  failed: {}", report.stats.failed);
        for failure in &report.stats.failures {
            println!("    {}: {}", failure.source_id, failure.error);
        }
    }
}
