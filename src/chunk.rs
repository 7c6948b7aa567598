//! Overlapping, boundary-aware text chunker.
//!
//! Splits a document body into [`Chunk`]s of at most `chunk_size`
//! characters. Consecutive chunks share `overlap` characters: the trailing
//! window of one chunk is repeated at the start of the next, which keeps
//! local context intact for the embedder.
//!
//! # Algorithm
//!
//! 1. The first chunk starts at character 0.
//! 2. The tentative end is `start + chunk_size` (clamped to the text length).
//! 3. If the text continues past the tentative end, walk backwards looking
//!    for a break, in order of preference: paragraph (`\n\n`), sentence end
//!    (`.`, `!`, `?` followed by whitespace), line break, any whitespace.
//!    Breaks closer than `max(chunk_size / 2, overlap + 1)` characters to
//!    the start are ignored so every step makes progress.
//! 4. Without a usable break, cut hard at the tentative end.
//! 5. The next chunk starts at `end - overlap`.
//!
//! Offsets are character offsets (not bytes), so multi-byte text never
//! splits inside a code point.
//!
//! # Example
//!
//! ```rust
//! use oracle_rag::chunk::ChunkingPolicy;
//!
//! let policy = ChunkingPolicy::new(500, 50).unwrap();
//! let text = "x".repeat(1200);
//! let spans: Vec<(usize, usize)> = policy
//!     .chunks("doc-1", &text)
//!     .map(|c| (c.start, c.end))
//!     .collect();
//! assert_eq!(spans, vec![(0, 500), (450, 950), (900, 1200)]);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::models::Chunk;

/// Validated chunk size / overlap pair, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkingPolicy {
    /// Both values must be positive and `overlap < chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::config("chunk_size must be > 0"));
        }
        if overlap == 0 {
            return Err(RagError::config("chunk_overlap must be > 0"));
        }
        if overlap >= chunk_size {
            return Err(RagError::config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Lazily chunk `text`. Calling this again restarts from the beginning
    /// and yields the same sequence.
    pub fn chunks<'a>(&self, document_id: &'a str, text: &str) -> Chunks<'a> {
        let chars: Vec<char> = text.chars().collect();
        let next_start = if chars.is_empty() { None } else { Some(0) };
        Chunks {
            policy: *self,
            document_id,
            chars,
            next_start,
            ordinal: 0,
        }
    }

    /// Approximate number of chunks for a text of `char_len` characters,
    /// ignoring boundary snapping.
    pub fn estimate_count(&self, char_len: usize) -> usize {
        if char_len == 0 {
            return 0;
        }
        if char_len <= self.chunk_size {
            return 1;
        }
        let step = self.chunk_size - self.overlap;
        1 + (char_len - self.chunk_size).div_ceil(step)
    }
}

/// Iterator over the chunks of one document. Cloning it forks the sequence.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    policy: ChunkingPolicy,
    document_id: &'a str,
    chars: Vec<char>,
    next_start: Option<usize>,
    ordinal: usize,
}

impl Chunks<'_> {
    fn snap_end(&self, start: usize, hard_end: usize) -> usize {
        let min_end = start + (self.policy.chunk_size / 2).max(self.policy.overlap + 1);
        if min_end >= hard_end {
            return hard_end;
        }
        let chars = &self.chars;
        let breaks: [&dyn Fn(usize) -> bool; 4] = [
            &|p| chars[p - 1] == '\n' && chars[p - 2] == '\n',
            &|p| chars[p - 1].is_whitespace() && matches!(chars[p - 2], '.' | '!' | '?'),
            &|p| chars[p - 1] == '\n',
            &|p| chars[p - 1].is_whitespace(),
        ];
        for is_break in breaks {
            // min_end >= 2 because overlap >= 1
            if let Some(p) = (min_end..=hard_end).rev().find(|&p| is_break(p)) {
                return p;
            }
        }
        hard_end
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let start = self.next_start?;
        let total = self.chars.len();
        let hard_end = (start + self.policy.chunk_size).min(total);
        let end = if hard_end < total {
            self.snap_end(start, hard_end)
        } else {
            total
        };

        self.next_start = if end >= total {
            None
        } else {
            Some(end - self.policy.overlap)
        };

        let text: String = self.chars[start..end].iter().collect();
        let ordinal = self.ordinal;
        self.ordinal += 1;
        Some(make_chunk(self.document_id, ordinal, start, end, text))
    }
}

/// Chunk `text` eagerly.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let policy = ChunkingPolicy::new(chunk_size, overlap)?;
    Ok(policy.chunks(document_id, text).collect())
}

/// Rebuild the source text from chunks ordered by ordinal, dropping the
/// overlapping prefix of each chunk.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut covered = 0usize;
    for c in chunks {
        let skip = covered.saturating_sub(c.start);
        out.extend(c.text.chars().skip(skip));
        covered = covered.max(c.end);
    }
    out
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, ordinal: usize, start: usize, end: usize, text: String) -> Chunk {
    Chunk {
        id: Chunk::make_id(document_id, ordinal),
        document_id: document_id.to_string(),
        ordinal,
        start,
        end,
        char_count: end - start,
        overlaps_previous: ordinal > 0,
        hash: hash_text(&text),
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(chunks: &[Chunk]) -> Vec<(usize, usize)> {
        chunks.iter().map(|c| (c.start, c.end)).collect()
    }

    #[test]
    fn test_rejects_invalid_policy() {
        assert!(matches!(
            ChunkingPolicy::new(0, 0),
            Err(RagError::Configuration(_))
        ));
        assert!(matches!(
            ChunkingPolicy::new(100, 0),
            Err(RagError::Configuration(_))
        ));
        assert!(matches!(
            ChunkingPolicy::new(100, 100),
            Err(RagError::Configuration(_))
        ));
        assert!(ChunkingPolicy::new(100, 99).is_ok());
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        let chunks = chunk_text("doc1", "", 500, 50).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_document_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 500, 50).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(spans(&chunks), vec![(0, 13)]);
        assert!(!chunks[0].overlaps_previous);
        assert_eq!(chunks[0].id, "doc1#0");
    }

    #[test]
    fn test_hard_cut_scenario_1200_chars() {
        let text = "x".repeat(1200);
        let chunks = chunk_text("doc1", &text, 500, 50).unwrap();
        assert_eq!(spans(&chunks), vec![(0, 500), (450, 950), (900, 1200)]);
        assert!(chunks[1].overlaps_previous);
        assert_eq!(chunks.last().unwrap().end, 1200);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let first = "The first sentence is here. ".repeat(10);
        let text = format!("{}{}", first, "tail ".repeat(40));
        let chunks = chunk_text("doc1", &text, 300, 20).unwrap();
        let c0 = &chunks[0];
        assert!(c0.end < 300);
        assert!(c0.text.trim_end().ends_with('.'), "got {:?}", c0.text);
    }

    #[test]
    fn test_prefers_paragraph_over_sentence() {
        let text = format!(
            "{}\n\n{}",
            "Alpha beta gamma. ".repeat(10).trim_end(),
            "Delta epsilon. ".repeat(20)
        );
        let chunks = chunk_text("doc1", &text, 220, 10).unwrap();
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_reconstruct_covers_text_exactly() {
        let text = (0..80)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ");
        for (size, overlap) in [(100, 10), (64, 63), (500, 50), (37, 5)] {
            let chunks = chunk_text("doc", &text, size, overlap).unwrap();
            assert_eq!(reconstruct(&chunks), text, "size={} overlap={}", size, overlap);
            assert_eq!(chunks.last().unwrap().end, text.chars().count());
            for c in &chunks {
                assert!(c.char_count <= size);
            }
        }
    }

    #[test]
    fn test_multibyte_offsets_are_characters() {
        let text = "┌──┐ héllo wörld ".repeat(30);
        let chunks = chunk_text("doc", &text, 40, 8).unwrap();
        assert_eq!(reconstruct(&chunks), text);
        for c in &chunks {
            assert_eq!(c.text.chars().count(), c.end - c.start);
        }
    }

    #[test]
    fn test_deterministic_and_restartable() {
        let policy = ChunkingPolicy::new(50, 10).unwrap();
        let text = "Alpha. Beta gamma delta.\n\nEpsilon zeta eta theta iota kappa. ".repeat(6);
        let a: Vec<Chunk> = policy.chunks("d", &text).collect();
        let b: Vec<Chunk> = policy.chunks("d", &text).collect();
        assert_eq!(a, b);

        let mut it = policy.chunks("d", &text);
        it.next();
        let forked: Vec<Chunk> = it.clone().collect();
        let rest: Vec<Chunk> = it.collect();
        assert_eq!(forked, rest);
    }

    #[test]
    fn test_estimate_count_matches_hard_cuts() {
        let policy = ChunkingPolicy::new(500, 50).unwrap();
        assert_eq!(policy.estimate_count(0), 0);
        assert_eq!(policy.estimate_count(400), 1);
        assert_eq!(policy.estimate_count(1200), 3);
        let text = "y".repeat(5000);
        assert_eq!(
            policy.chunks("d", &text).count(),
            policy.estimate_count(5000)
        );
    }
}
