//! Line-window text chunker.
//!
//! Splits a memory file into windows of whole lines that respect a
//! `max_tokens` budget, with a trailing `overlap_tokens` carried into the
//! next window so a fact that straddles a boundary is retrievable from
//! either side. Every chunk records its 1-based line range, which is what
//! snippet fetches and the ranker's stable key use.
//!
//! # Algorithm
//!
//! 1. Convert tokens to chars using a 4 chars/token ratio.
//! 2. Walk the lines; a line longer than the window is cut into
//!    window-sized segments on char boundaries.
//! 3. Accumulate segments until the next one would overflow the window,
//!    then flush and keep the trailing lines worth `overlap` chars, minus
//!    any that would leave no room for that next segment.
//! 4. Empty text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use memory_harness_core::chunk::{chunk_lines, ChunkingParams};
//!
//! let chunks = chunk_lines("# Notes\nuse sqlite\n", &ChunkingParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Smallest window, whatever the configured budget.
const MIN_WINDOW_CHARS: usize = 32;

/// Chunk window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 80,
        }
    }
}

/// One window of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    /// SHA-256 of `text`; the embedding cache key.
    pub hash: String,
}

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id from its location and content.
pub fn chunk_id(source: &str, path: &str, start_line: i64, end_line: i64, hash: &str) -> String {
    hash_text(&format!("{}:{}:{}:{}:{}", source, path, start_line, end_line, hash))
}

/// Split `text` into line windows.
pub fn chunk_lines(text: &str, params: &ChunkingParams) -> Vec<TextChunk> {
    let max_chars = (params.max_tokens * CHARS_PER_TOKEN).max(MIN_WINDOW_CHARS);
    let overlap_chars = (params.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut chunks = Vec::new();
    let mut current: Vec<(i64, &str)> = Vec::new();
    let mut current_chars = 0usize;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx as i64 + 1;
        for segment in split_long_line(line, max_chars) {
            let size = segment.len() + 1;
            if current_chars + size > max_chars && !current.is_empty() {
                flush(&current, &mut chunks);
                current = carry_overlap(&current, overlap_chars, max_chars.saturating_sub(size));
                current_chars = current.iter().map(|(_, s)| s.len() + 1).sum();
            }
            current.push((line_no, segment));
            current_chars += size;
        }
    }
    flush(&current, &mut chunks);

    chunks
}

fn split_long_line(line: &str, max_chars: usize) -> Vec<&str> {
    if line.len() <= max_chars {
        return vec![line];
    }
    let mut segments = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        let mut end = snap_to_char_boundary(rest, max_chars);
        if end == 0 {
            end = rest
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
        }
        segments.push(&rest[..end]);
        rest = &rest[end..];
    }
    segments
}

fn flush(current: &[(i64, &str)], chunks: &mut Vec<TextChunk>) {
    let (first, last) = match (current.first(), current.last()) {
        (Some(f), Some(l)) => (f.0, l.0),
        _ => return,
    };
    let text = current
        .iter()
        .map(|(_, s)| *s)
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() {
        return;
    }
    chunks.push(TextChunk {
        start_line: first,
        end_line: last,
        hash: hash_text(&text),
        text,
    });
}

/// Trailing lines of `current` worth at least `overlap_chars`, never more
/// than `room` chars in total.
fn carry_overlap<'a>(
    current: &[(i64, &'a str)],
    overlap_chars: usize,
    room: usize,
) -> Vec<(i64, &'a str)> {
    if overlap_chars == 0 {
        return Vec::new();
    }
    let mut kept = Vec::new();
    let mut acc = 0usize;
    for entry in current.iter().rev() {
        acc += entry.1.len() + 1;
        kept.push(*entry);
        if acc >= overlap_chars {
            break;
        }
    }
    kept.reverse();

    // Drop from the front until the carry fits.
    let mut start = 0;
    while start < kept.len() && acc > room {
        acc -= kept[start].1.len() + 1;
        start += 1;
    }
    kept.split_off(start)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
