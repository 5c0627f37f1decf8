//! PDF report discovery and per-page text extraction.
//!
//! Walks `ingest.reports_dir`, keeps files matching the include globs and
//! not matching the exclude globs, and extracts one [`Segment`] per page.
//! A report's `file` attribute is `"<reports_dir>/<relative path>"` with `/`
//! separators (e.g. `reports/housing-outlook.pdf`), and pages are 0-based.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use report_chat_core::models::Segment;

use crate::config::IngestConfig;

/// A PDF found under the reports directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFile {
    pub path: PathBuf,
    /// Display path used as the chunk `file` attribute.
    pub file: String,
}

/// Output of [`load_reports`].
#[derive(Debug, Default)]
pub struct LoadedReports {
    pub segments: Vec<Segment>,
    pub files_loaded: usize,
    /// `(file, error)` for every report that could not be parsed.
    pub failures: Vec<(String, String)>,
}

/// List matching report files, sorted by `file` for deterministic order.
pub fn discover_reports(config: &IngestConfig) -> Result<Vec<ReportFile>> {
    let root = &config.reports_dir;
    if !root.exists() {
        bail!("Reports directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;
    let prefix = display_root(root);

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let file = if prefix.is_empty() {
            rel_str
        } else {
            format!("{}/{}", prefix, rel_str)
        };
        files.push(ReportFile {
            path: path.to_path_buf(),
            file,
        });
    }

    files.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(files)
}

/// Extract text from each page of a PDF held in memory.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<String>> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))
}

/// Load every report as page segments.
///
/// Extraction runs on the blocking pool. A report that fails to read or
/// parse is logged and reported in [`LoadedReports::failures`], and the
/// remaining reports are still loaded.
pub async fn load_reports(config: &IngestConfig) -> Result<LoadedReports> {
    let files = discover_reports(config)?;
    let mut out = LoadedReports::default();

    for report in files {
        match load_one(&report).await {
            Ok(pages) => {
                tracing::debug!(file = %report.file, pages = pages.len(), "loaded report");
                out.files_loaded += 1;
                out.segments.extend(
                    pages
                        .into_iter()
                        .enumerate()
                        .map(|(i, text)| Segment::new(report.file.clone(), i as i64, text)),
                );
            }
            Err(e) => {
                tracing::warn!(file = %report.file, error = %format!("{:#}", e), "skipping report");
                out.failures.push((report.file.clone(), format!("{:#}", e)));
            }
        }
    }

    Ok(out)
}

async fn load_one(report: &ReportFile) -> Result<Vec<String>> {
    let bytes = tokio::fs::read(&report.path)
        .await
        .with_context(|| format!("Failed to read {}", report.path.display()))?;
    tokio::task::spawn_blocking(move || extract_pages(&bytes))
        .await
        .context("PDF extraction panicked")?
}

/// `reports_dir` as written in chunk `file` attributes: `/` separators, no
/// leading `./`, no trailing `/`.
fn display_root(root: &Path) -> String {
    let s = root.to_string_lossy().replace('\\', "/");
    let s = s.trim_start_matches("./").trim_end_matches('/');
    if s == "." {
        String::new()
    } else {
        s.to_string()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &Path) -> IngestConfig {
        IngestConfig {
            reports_dir: dir.to_path_buf(),
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("archive")).unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("archive").join("old.pdf"), b"x").unwrap();

        let mut config = config_for(dir.path());
        config.exclude_globs = vec!["archive/**".to_string()];
        let files = discover_reports(&config).unwrap();

        let prefix = display_root(dir.path());
        let names: Vec<String> = files.iter().map(|f| f.file.clone()).collect();
        assert_eq!(
            names,
            vec![format!("{}/a.pdf", prefix), format!("{}/b.pdf", prefix)]
        );
    }

    #[test]
    fn test_missing_dir_is_error() {
        let config = config_for(Path::new("/definitely/not/here"));
        assert!(discover_reports(&config).is_err());
    }

    #[test]
    fn test_display_root() {
        assert_eq!(display_root(Path::new("reports")), "reports");
        assert_eq!(display_root(Path::new("./reports/")), "reports");
        assert_eq!(display_root(Path::new(".")), "");
    }

    #[test]
    fn test_invalid_pdf_is_error() {
        assert!(extract_pages(b"not a pdf").is_err());
    }

    #[tokio::test]
    async fn test_unparseable_report_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.pdf"), b"not a pdf").unwrap();
        let loaded = load_reports(&config_for(dir.path())).await.unwrap();
        assert_eq!(loaded.files_loaded, 0);
        assert_eq!(loaded.failures.len(), 1);
        assert!(loaded.segments.is_empty());
    }
}
