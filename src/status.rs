//! Index health overview.
//!
//! Summarises what `report-chat status` can see: reports on disk, how many
//! of them have display metadata, and what the record and vector stores hold
//! for the configured namespace.

use anyhow::Result;
use std::collections::BTreeMap;

use report_chat_core::citation::ReportCatalog;
use report_chat_core::models::IndexRecord;

use crate::config::Config;
use crate::loader::{self, ReportFile};
use crate::reports;
use crate::stores;

/// Per-report totals from the record store.
#[derive(Debug, Default, PartialEq)]
struct ReportIndexStats {
    pages: usize,
    chunks: i64,
    last_indexed: Option<i64>,
}

/// Files on disk that have no metadata entry.
fn missing_metadata<'a>(files: &'a [ReportFile], catalog: &ReportCatalog) -> Vec<&'a str> {
    files
        .iter()
        .filter(|f| catalog.lookup(&f.file).is_none())
        .map(|f| f.file.as_str())
        .collect()
}

/// Group records by the report they came from. Records carry only the
/// source id, so the file is recovered by stripping the `_<page>` suffix.
fn by_report(records: &[IndexRecord]) -> BTreeMap<String, ReportIndexStats> {
    let mut out: BTreeMap<String, ReportIndexStats> = BTreeMap::new();
    for r in records {
        let file = match r.source_id.rsplit_once('_') {
            Some((file, page)) if page.parse::<i64>().is_ok() => file,
            _ => r.source_id.as_str(),
        };
        let entry = out.entry(file.to_string()).or_default();
        entry.pages += 1;
        entry.chunks += r.chunk_count;
        entry.last_indexed = entry.last_indexed.max(Some(r.updated_at));
    }
    out
}

/// Run the status command: inspect disk, metadata, and both stores.
pub async fn run_status(config: &Config) -> Result<()> {
    let files = loader::discover_reports(&config.ingest)?;
    let catalog = reports::load_catalog(&config.reports)?;
    let missing = missing_metadata(&files, &catalog);

    let namespace = config.vector_store.namespace();
    let record_manager = stores::open_record_manager(config).await?;
    let records = record_manager.list(&namespace).await?;
    let vectors = stores::open_vector_store(config).await?;
    let vector_count = vectors.count().await?;

    let indexed_chunks: i64 = records.iter().map(|r| r.chunk_count).sum();

    println!("Report Chat: Index Status");
    println!("=========================");
    println!();
    println!("  Reports dir:  {}", config.ingest.reports_dir.display());
    println!("  Reports:      {}", files.len());
    println!(
        "  Metadata:     {} / {} reports ({} entries in {})",
        files.len() - missing.len(),
        files.len(),
        catalog.len(),
        config.reports.metadata_path.display()
    );
    for file in &missing {
        println!("    no metadata: {}", file);
    }
    println!();
    println!("  Namespace:    {}", namespace);
    println!("  Records:      {} pages, {} chunks", records.len(), indexed_chunks);
    println!("  Vectors:      {}", vector_count);
    if vector_count != indexed_chunks.max(0) as u64 {
        println!("  warning: vector count differs from recorded chunk count; re-run `report-chat ingest`");
    }

    let grouped = by_report(&records);
    if !grouped.is_empty() {
        println!();
        println!("  By report:");
        println!("  {:<40} {:>6} {:>8}   {}", "FILE", "PAGES", "CHUNKS", "LAST INDEXED");
        println!("  {}", "-".repeat(76));
        for (file, s) in &grouped {
            let when = s
                .last_indexed
                .map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string());
            println!("  {:<40} {:>6} {:>8}   {}", file, s.pages, s.chunks, when);
        }
    }
    println!();

    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use report_chat_core::models::ReportMetadata;

    fn record(source_id: &str, chunks: i64, updated_at: i64) -> IndexRecord {
        IndexRecord {
            namespace: "sqlite/ReportChunks".into(),
            source_id: source_id.into(),
            content_hash: "h".into(),
            chunk_count: chunks,
            batch_id: "b".into(),
            updated_at,
        }
    }

    #[test]
    fn test_by_report_groups_pages() {
        let grouped = by_report(&[
            record("reports/a_b.pdf_0", 2, 10),
            record("reports/a_b.pdf_1", 3, 30),
            record("reports/c.pdf_0", 1, 20),
        ]);
        assert_eq!(
            grouped["reports/a_b.pdf"],
            ReportIndexStats {
                pages: 2,
                chunks: 5,
                last_indexed: Some(30)
            }
        );
        assert_eq!(grouped["reports/c.pdf"].pages, 1);
    }

    #[test]
    fn test_missing_metadata() {
        let catalog = ReportCatalog::from_entries(
            vec![ReportMetadata {
                file: "a.pdf".into(),
                name: None,
                author: None,
                date_published: None,
            }],
            "reports/",
        );
        let files = vec![
            ReportFile {
                path: "reports/a.pdf".into(),
                file: "reports/a.pdf".into(),
            },
            ReportFile {
                path: "reports/b.pdf".into(),
                file: "reports/b.pdf".into(),
            },
        ];
        assert_eq!(missing_metadata(&files, &catalog), vec!["reports/b.pdf"]);
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
