//! Paragraph-boundary chunker for artifact bodies.
//!
//! The ingest phase indexes an artifact's markdown body (frontmatter
//! stripped) as a list of [`Chunk`]s. Paragraphs (`\n\n`) are packed into a
//! chunk until the next one would exceed `max_tokens` (4 chars per token).
//! A markdown heading always opens a new chunk so a chapter never starts
//! mid-chunk. Oversized paragraphs are hard-split at the last newline or
//! space before the limit.
//!
//! ```rust
//! use docflow_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-1", "# Intro\n\nHello.\n\n# Next\n\nMore.", 700);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].chunk_index, 1);
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// `{document_id}:{chunk_index}`
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_heading(paragraph: &str) -> bool {
    let hashes = paragraph.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && paragraph[hashes..].starts_with(' ')
}

struct Builder<'a> {
    document_id: &'a str,
    chunks: Vec<Chunk>,
    buf: String,
}

impl Builder<'_> {
    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buf);
        self.push(&text);
    }

    fn push(&mut self, text: &str) {
        let index = self.chunks.len() as i64;
        self.chunks.push(Chunk {
            id: format!("{}:{}", self.document_id, index),
            document_id: self.document_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            hash: content_hash(text),
        });
    }
}

/// Split `text` into chunks of at most `max_tokens`.
///
/// Always returns at least one chunk; indices are contiguous from 0.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut builder = Builder {
        document_id,
        chunks: Vec::new(),
        buf: String::new(),
    };

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        let buf_len = builder.buf.chars().count();

        if is_heading(paragraph) || (buf_len > 0 && buf_len + 2 + len > max_chars) {
            builder.flush();
        }

        if len > max_chars {
            builder.flush();
            for piece in hard_split(paragraph, max_chars) {
                builder.push(piece);
            }
            continue;
        }

        if !builder.buf.is_empty() {
            builder.buf.push_str("\n\n");
        }
        builder.buf.push_str(paragraph);
    }
    builder.flush();

    if builder.chunks.is_empty() {
        builder.push(text.trim());
    }
    builder.chunks
}

/// Pieces of at most `max_chars` characters, preferring whitespace breaks.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while !rest.is_empty() {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = if limit < rest.len() {
            rest[..limit]
                .rfind(['\n', ' '])
                .filter(|pos| *pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        rest = &rest[cut..];
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_one_chunk() {
        let chunks = chunk_text("d", "", 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "d:0");
    }

    #[test]
    fn small_paragraphs_are_packed() {
        let chunks = chunk_text("d", "one\n\ntwo\n\nthree", 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "one\n\ntwo\n\nthree");
    }

    #[test]
    fn headings_open_new_chunks() {
        let text = "# A\n\nalpha\n\n## B\n\nbeta\n\n#hashtag is not a heading";
        let chunks = chunk_text("d", text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("## B"));
        assert!(chunks[1].text.ends_with("heading"));
    }

    #[test]
    fn oversized_paragraph_is_split_on_whitespace() {
        let text = "word ".repeat(40);
        let chunks = chunk_text("d", &text, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(c.text.chars().count() <= 20);
            assert!(!c.text.starts_with(' '));
        }
    }

    #[test]
    fn multibyte_text_is_split_safely() {
        let text = "äöü".repeat(30);
        let chunks = chunk_text("d", &text, 2);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn hashes_are_stable() {
        let a = chunk_text("d", "Alpha\n\nBeta", 2);
        let b = chunk_text("d", "Alpha\n\nBeta", 2);
        assert_eq!(a, b);
        assert_eq!(a[0].hash, content_hash("Alpha"));
    }
}
