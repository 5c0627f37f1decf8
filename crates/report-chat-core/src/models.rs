//! Core data models used throughout Report Chat.
//!
//! These types represent the page segments, chunks, index records, chat
//! turns, and retrieved documents that flow through the ingestion and
//! question-answering pipelines.

use serde::{Deserialize, Serialize};

/// One page of text produced by the document loader, before chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Page text as extracted from the PDF.
    pub content: String,
    /// Originating document path (e.g. `reports/housing-outlook.pdf`).
    pub file: String,
    /// 0-based page number within `file`.
    pub page: i64,
    /// Stable identifier for this page: `"{file}_{page}"`.
    pub source_id: String,
}

impl Segment {
    pub fn new(file: impl Into<String>, page: i64, content: impl Into<String>) -> Self {
        let file = file.into();
        let source_id = source_id_for(&file, page);
        Self {
            content: content.into(),
            file,
            page,
            source_id,
        }
    }
}

/// Build the source identifier for a page of a document.
pub fn source_id_for(file: &str, page: i64) -> String {
    format!("{}_{}", file, page)
}

/// A unit of indexable text: the atomic unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from `source_id` and `chunk_index`.
    pub id: String,
    /// Stable identifier of the logical content unit (the page).
    pub source_id: String,
    /// Originating document path.
    pub file: String,
    /// 0-based page number.
    pub page: i64,
    /// Position of this chunk within its source group.
    pub chunk_index: i64,
    /// Chunk text.
    pub content: String,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
}

/// Persisted bookkeeping entry for one indexed source group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub namespace: String,
    pub source_id: String,
    /// SHA-256 over the ordered chunk hashes of the group.
    pub content_hash: String,
    /// Number of vectors stored for this source group.
    pub chunk_count: i64,
    /// Identifier of the ingestion pass that last saw this group.
    pub batch_id: String,
    /// Unix timestamp of the last write.
    pub updated_at: i64,
}

/// A single utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationTurn {
    Human(String),
    Ai(String),
}

impl ConversationTurn {
    pub fn text(&self) -> &str {
        match self {
            ConversationTurn::Human(t) | ConversationTurn::Ai(t) => t,
        }
    }
}

/// Ordered conversation turns, oldest first.
pub type ChatHistory = Vec<ConversationTurn>;

/// A chunk returned by the retriever together with its similarity rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedDocument {
    pub chunk: Chunk,
    /// 0-based rank; 0 is the most similar.
    pub rank: usize,
    /// Raw similarity reported by the vector store (higher is closer).
    pub score: f64,
}

/// Display attributes for a report, loaded from the side-loaded metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub file: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date_published: Option<String>,
}

/// One entry of the `sources` message sent to chat clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source: String,
    pub file: String,
    pub name: Option<String>,
    pub author: Option<String>,
    pub date_published: Option<String>,
}
