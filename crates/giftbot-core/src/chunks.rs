//! Splits serialized product records into chunks for embedding and search.
//! Prefers paragraph boundaries; falls back to lines, sentences, words, then characters.
//! Consecutive chunks of one record overlap so phrases at a boundary survive in both.

use std::collections::VecDeque;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::ProductRecord;

/// Default maximum characters per chunk.
pub const DEFAULT_MAX_CHARS: usize = 1500;
/// Default number of characters shared between consecutive chunks.
pub const DEFAULT_OVERLAP_CHARS: usize = 100;

/// Separators tried in order, coarsest first. The empty string means "split into characters".
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// A chunk of a product's text, with source reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub text: String,
    /// `product_id` of the record this chunk came from.
    pub source_id: String,
    /// Character offset of the chunk's first character within the serialized record.
    pub start_offset: usize,
}

/// Recursive character splitter with overlap.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    max_chars: usize,
    overlap: usize,
}

impl TextSplitter {
    pub fn new(max_chars: usize, overlap: usize) -> Result<Self, SplitterError> {
        if max_chars == 0 {
            return Err(SplitterError::ZeroSize);
        }
        if overlap > max_chars {
            return Err(SplitterError::OverlapTooLarge { overlap, max_chars });
        }
        Ok(Self { max_chars, overlap })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Splits `text` into `(char_offset, chunk_text)` pairs.
    pub fn split(&self, text: &str) -> Vec<(usize, String)> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if char_len(trimmed) <= self.max_chars {
            let start = text.len() - text.trim_start().len();
            return vec![(char_offset(text, start), trimmed.to_string())];
        }

        let mut spans = Vec::new();
        self.split_span(text, 0..text.len(), &SEPARATORS, &mut spans);
        spans
            .into_iter()
            .filter_map(|span| {
                let raw = &text[span.clone()];
                let piece = raw.trim();
                if piece.is_empty() {
                    return None;
                }
                let start = span.start + (raw.len() - raw.trim_start().len());
                Some((char_offset(text, start), piece.to_string()))
            })
            .collect()
    }

    /// Splits `text[span]` on the first separator present, recursing into pieces
    /// that are still too long. Pushes byte ranges of merged chunks into `out`.
    fn split_span(&self, text: &str, span: Range<usize>, separators: &[&str], out: &mut Vec<Range<usize>>) {
        let segment = &text[span.clone()];
        let (sep_idx, sep) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || segment.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len() - 1, ""));
        let finer = &separators[sep_idx + 1..];

        let mut pieces = Vec::new();
        let mut start = span.start;
        if sep.is_empty() {
            for (i, ch) in segment.char_indices() {
                let s = span.start + i;
                pieces.push(s..s + ch.len_utf8());
            }
        } else {
            // Each piece keeps its trailing separator so pieces stay contiguous.
            for part in segment.split_inclusive(sep) {
                pieces.push(start..start + part.len());
                start += part.len();
            }
        }

        let mut fitting: Vec<Range<usize>> = Vec::new();
        for piece in pieces {
            if char_len(&text[piece.clone()]) <= self.max_chars {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                self.merge(text, std::mem::take(&mut fitting), out);
            }
            if finer.is_empty() {
                out.push(piece);
            } else {
                self.split_span(text, piece, finer, out);
            }
        }
        if !fitting.is_empty() {
            self.merge(text, fitting, out);
        }
    }

    /// Greedily merges contiguous pieces into chunks of at most `max_chars`,
    /// carrying up to `overlap` trailing characters into the next chunk.
    fn merge(&self, text: &str, pieces: Vec<Range<usize>>, out: &mut Vec<Range<usize>>) {
        let mut window: VecDeque<(Range<usize>, usize)> = VecDeque::new();
        let mut total = 0usize;
        for piece in pieces {
            let len = char_len(&text[piece.clone()]);
            if total + len > self.max_chars && !window.is_empty() {
                out.push(span_of(&window));
                while total > self.overlap || (total + len > self.max_chars && total > 0) {
                    match window.pop_front() {
                        Some((_, l)) => total -= l,
                        None => break,
                    }
                }
            }
            total += len;
            window.push_back((piece, len));
        }
        if !window.is_empty() {
            out.push(span_of(&window));
        }
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap: DEFAULT_OVERLAP_CHARS,
        }
    }
}

/// Chunk a single product record.
pub fn chunk_record(record: &ProductRecord, splitter: &TextSplitter) -> Vec<DocumentChunk> {
    let text = record.to_document_text();
    splitter
        .split(&text)
        .into_iter()
        .map(|(start_offset, text)| DocumentChunk {
            text,
            source_id: record.product_id.clone(),
            start_offset,
        })
        .collect()
}

/// Chunk all records. Returns chunks from all records in order.
pub fn ingest(records: &[ProductRecord], splitter: &TextSplitter) -> Vec<DocumentChunk> {
    let chunks: Vec<DocumentChunk> = records
        .iter()
        .flat_map(|r| chunk_record(r, splitter))
        .collect();
    debug!(records = records.len(), chunks = chunks.len(), "chunked catalog");
    chunks
}

fn span_of(window: &VecDeque<(Range<usize>, usize)>) -> Range<usize> {
    let start = window.front().map(|(r, _)| r.start).unwrap_or(0);
    let end = window.back().map(|(r, _)| r.end).unwrap_or(start);
    start..end
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_offset(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

#[derive(Debug, thiserror::Error)]
pub enum SplitterError {
    #[error("chunk size must be greater than zero")]
    ZeroSize,
    #[error("chunk overlap ({overlap}) must not exceed chunk size ({max_chars})")]
    OverlapTooLarge { overlap: usize, max_chars: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, fields: &[(&str, &str)]) -> ProductRecord {
        let mut all = vec![("product_id".to_string(), id.to_string())];
        all.extend(fields.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        ProductRecord {
            product_id: id.to_string(),
            fields: all,
        }
    }

    /// Text at `offset` (in chars) must match the chunk text.
    fn assert_offsets(text: &str, parts: &[(usize, String)]) {
        for (offset, part) in parts {
            let at: String = text.chars().skip(*offset).take(part.chars().count()).collect();
            assert_eq!(&at, part);
        }
    }

    #[test]
    fn short_record_is_one_chunk() {
        let r = record("B001", &[("description", "wireless headphones for teens")]);
        let c = chunk_record(&r, &TextSplitter::new(1500, 100).unwrap());
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].text, r.to_document_text());
        assert_eq!(c[0].source_id, "B001");
        assert_eq!(c[0].start_offset, 0);
    }

    #[test]
    fn long_record_respects_max_size() {
        let desc = "soft cotton scarf in many colors. ".repeat(80);
        let r = record("B002", &[("description", &desc)]);
        let splitter = TextSplitter::new(200, 40).unwrap();
        let c = chunk_record(&r, &splitter);
        assert!(c.len() > 1);
        assert!(c.iter().all(|ch| ch.text.chars().count() <= 200));
        assert!(c.iter().all(|ch| ch.source_id == "B002"));
        let parts: Vec<_> = c.iter().map(|ch| (ch.start_offset, ch.text.clone())).collect();
        assert_offsets(&r.to_document_text(), &parts);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..120).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let splitter = TextSplitter::new(100, 30).unwrap();
        let parts = splitter.split(&text);
        assert!(parts.len() > 2);
        assert_offsets(&text, &parts);
        for pair in parts.windows(2) {
            let (prev_start, prev) = &pair[0];
            let (next_start, _) = &pair[1];
            let prev_end = prev_start + prev.chars().count();
            assert!(next_start < &prev_end, "chunks should overlap");
            assert!(prev_end - next_start <= 30, "overlap bounded by configured size");
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let p1 = "a".repeat(60);
        let p2 = "b".repeat(60);
        let text = format!("{p1}\n\n{p2}");
        let parts = TextSplitter::new(80, 0).unwrap().split(&text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], (0, p1));
        assert_eq!(parts[1], (62, p2));
    }

    #[test]
    fn unbroken_text_falls_back_to_characters() {
        let text = "x".repeat(250);
        let parts = TextSplitter::new(100, 10).unwrap().split(&text);
        assert!(parts.len() >= 3);
        assert!(parts.iter().all(|(_, p)| p.chars().count() <= 100));
        assert_eq!(parts[1].0, 90);
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = format!("{}\n{}", "é".repeat(30), "ü".repeat(30));
        let parts = TextSplitter::new(40, 0).unwrap().split(&text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].0, 31);
        assert_offsets(&text, &parts);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(matches!(TextSplitter::new(0, 0), Err(SplitterError::ZeroSize)));
        assert!(matches!(
            TextSplitter::new(10, 11),
            Err(SplitterError::OverlapTooLarge { .. })
        ));
    }

    #[test]
    fn ingest_keeps_record_order() {
        let records = vec![record("A", &[("t", "one")]), record("B", &[("t", "two")])];
        let chunks = ingest(&records, &TextSplitter::default());
        let ids: Vec<_> = chunks.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(ids, ["A", "B"]);
    }
}
