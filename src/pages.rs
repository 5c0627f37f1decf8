//! `report-chat pages`: page counts per report.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::loader;

/// Page count of one PDF file.
pub fn count_pages(path: &Path) -> Result<usize> {
    let doc = lopdf::Document::load(path)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(doc.get_pages().len())
}

/// Print `<file>: <n> pages` per report and the total.
pub fn run_pages(config: &Config) -> Result<()> {
    let files = loader::discover_reports(&config.ingest)?;
    let mut total = 0usize;

    for report in &files {
        match count_pages(&report.path) {
            Ok(n) => {
                total += n;
                println!("{}: {} pages", report.file, n);
            }
            Err(e) => {
                tracing::warn!(file = %report.file, error = %format!("{:#}", e), "could not count pages");
                println!("{}: unreadable", report.file);
            }
        }
    }

    println!();
    println!("Total pages in all PDF reports: {}", total);
    Ok(())
}
