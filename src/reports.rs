//! Report display metadata (`reports_metadata.json`).
//!
//! The file is a JSON array of objects keyed by `file`:
//!
//! ```json
//! [
//!   { "file": "housing-outlook.pdf", "name": "Housing Market Outlook",
//!     "author": "CMHC", "date_published": "2023-05-01" }
//! ]
//! ```

use anyhow::{Context, Result};

use report_chat_core::citation::ReportCatalog;
use report_chat_core::models::ReportMetadata;

use crate::config::ReportsConfig;

/// Load the catalog. A missing file yields an empty catalog with a warning,
/// so every citation is skipped rather than the service refusing to start.
pub fn load_catalog(config: &ReportsConfig) -> Result<ReportCatalog> {
    let path = &config.metadata_path;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "report metadata file not found; citations will be empty");
        return Ok(ReportCatalog::from_entries(Vec::new(), config.strip_prefix.clone()));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report metadata: {}", path.display()))?;
    let entries: Vec<ReportMetadata> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report metadata: {}", path.display()))?;

    tracing::info!(path = %path.display(), reports = entries.len(), "loaded report metadata");
    Ok(ReportCatalog::from_entries(entries, config.strip_prefix.clone()))
}
