//! Deterministic overlapping text chunker.
//!
//! Splits page [`Segment`]s into bounded-size [`Chunk`]s whose windows
//! overlap by a configurable amount, so that a passage cut at a window edge
//! still appears whole in at least one chunk.
//!
//! Index reconciliation compares chunk hashes across ingestion runs, so the
//! chunker is a pure function of its input: identical text and settings
//! always produce byte-identical chunks with identical ids.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` / `overlap_tokens` to bytes using a 4 chars/token ratio.
//! 2. Take a window of at most `max_chars` bytes (snapped to a UTF-8 boundary).
//! 3. Cut the window at the last paragraph break, newline, or space found in
//!    its second half; otherwise hard-cut at the window end.
//! 4. Start the next window `overlap_chars` before the cut, moved forward to
//!    the next whitespace so that windows begin on a word.
//! 5. Trim each piece and drop empty ones. Empty input yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use report_chat_core::chunk::chunk_segment;
//! use report_chat_core::models::Segment;
//!
//! let seg = Segment::new("reports/a.pdf", 0, "Hello world.\n\nSecond paragraph.");
//! let chunks = chunk_segment(&seg, 1000, 50);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].source_id, "reports/a.pdf_0");
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, Segment};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Preferred cut points, strongest first.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Split a segment into overlapping chunks.
///
/// Every chunk inherits the segment's `source_id`, `file`, and `page`, and
/// gets a contiguous `chunk_index` starting at 0.
pub fn chunk_segment(segment: &Segment, max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars - 1);

    split_windows(&segment.content, max_chars, overlap_chars)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(segment, i as i64, piece))
        .collect()
}

/// Chunk every segment in order.
pub fn chunk_segments(segments: &[Segment], max_tokens: usize, overlap_tokens: usize) -> Vec<Chunk> {
    segments
        .iter()
        .flat_map(|s| chunk_segment(s, max_tokens, overlap_tokens))
        .collect()
}

/// Cut `text` into trimmed windows of at most `max_chars` bytes that overlap
/// by roughly `overlap_chars` bytes.
pub fn split_windows(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<&str> {
    let text = text.trim();
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut hard_end = snap_to_char_boundary(text, start + max_chars);
        if hard_end <= start {
            hard_end = next_char_boundary(text, start);
        }

        let end = if hard_end < text.len() {
            find_break(text, start, hard_end)
        } else {
            text.len()
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }

        if end >= text.len() {
            break;
        }
        start = next_window_start(text, start, end, overlap_chars);
    }

    pieces
}

/// Find the cut position for the window `[start, hard_end)`.
fn find_break(text: &str, start: usize, hard_end: usize) -> usize {
    let window = &text[start..hard_end];
    let min_pos = window.len() / 2;
    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            if pos >= min_pos {
                return start + pos + sep.len();
            }
        }
    }
    hard_end
}

/// Where the window after `[start, end)` begins. Always `> start`.
fn next_window_start(text: &str, start: usize, end: usize, overlap_chars: usize) -> usize {
    if overlap_chars == 0 || end - start <= overlap_chars {
        return end;
    }

    let candidate = snap_to_char_boundary(text, end - overlap_chars);
    if candidate <= start {
        return end;
    }

    match text[candidate..end]
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
    {
        Some((offset, c)) => {
            let aligned = candidate + offset + c.len_utf8();
            if aligned < end {
                aligned
            } else {
                candidate
            }
        }
        None => candidate,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// The byte index just past the char starting at `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map(|c| index + c.len_utf8())
        .unwrap_or(s.len())
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id for position `index` of `source_id`.
pub fn chunk_id(source_id: &str, index: i64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}#{}", source_id, index).as_bytes(),
    )
    .to_string()
}

fn make_chunk(segment: &Segment, index: i64, text: &str) -> Chunk {
    Chunk {
        id: chunk_id(&segment.source_id, index),
        source_id: segment.source_id.clone(),
        file: segment.file.clone(),
        page: segment.page,
        chunk_index: index,
        content: text.to_string(),
        hash: content_hash(text),
    }
}
