//! Citation formatting over retrieved documents.
//!
//! Citations are derived from the retriever's raw output, never from the
//! synthesized text. Each retrieved chunk that carries a file is joined with
//! its [`ReportMetadata`] entry; the resulting list is deduplicated by
//! `source` keeping the first occurrence.

use std::collections::{HashMap, HashSet};

use crate::models::{ReportMetadata, RetrievedDocument, SourceInfo};

/// Read-only side-table of report display metadata keyed by file path.
#[derive(Debug, Clone, Default)]
pub struct ReportCatalog {
    entries: HashMap<String, ReportMetadata>,
    strip_prefix: String,
}

impl ReportCatalog {
    /// Build a catalog. `strip_prefix` (e.g. `"reports/"`) is removed from a
    /// document's file path when the full path is not a key.
    pub fn from_entries(entries: Vec<ReportMetadata>, strip_prefix: impl Into<String>) -> Self {
        Self {
            entries: entries.into_iter().map(|m| (m.file.clone(), m)).collect(),
            strip_prefix: strip_prefix.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up metadata for `file`, first verbatim then with the prefix removed.
    pub fn lookup(&self, file: &str) -> Option<&ReportMetadata> {
        if let Some(m) = self.entries.get(file) {
            return Some(m);
        }
        if self.strip_prefix.is_empty() {
            return None;
        }
        file.strip_prefix(self.strip_prefix.as_str())
            .and_then(|rest| self.entries.get(rest))
    }
}

/// Result of [`collect_sources`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedSources {
    pub sources: Vec<SourceInfo>,
    /// Files that had no metadata entry and were left out.
    pub missing: Vec<String>,
}

/// Build the deduplicated sources list for a set of retrieved documents.
///
/// Documents with an empty `file` are ignored. Documents whose file has no
/// catalog entry are skipped and reported in [`CollectedSources::missing`].
pub fn collect_sources(docs: &[RetrievedDocument], catalog: &ReportCatalog) -> CollectedSources {
    let mut out = CollectedSources::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut missing_seen: HashSet<&str> = HashSet::new();

    for doc in docs {
        let chunk = &doc.chunk;
        if chunk.file.is_empty() || !seen.insert(chunk.source_id.as_str()) {
            continue;
        }
        match catalog.lookup(&chunk.file) {
            Some(meta) => out.sources.push(SourceInfo {
                source: chunk.source_id.clone(),
                file: chunk.file.clone(),
                name: meta.name.clone(),
                author: meta.author.clone(),
                date_published: meta.date_published.clone(),
            }),
            None => {
                if missing_seen.insert(chunk.file.as_str()) {
                    out.missing.push(chunk.file.clone());
                }
            }
        }
    }

    out
}
