use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::model::{ChunkDraft, Metadata, ORDINAL_KEY};

const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    pub fn split(&self, text: &str, metadata: &Metadata) -> Vec<ChunkDraft> {
        let drafts = split(
            text,
            metadata,
            self.config.chunk_size,
            self.config.chunk_overlap,
        );
        debug!(
            chunks = drafts.len(),
            chars = text.chars().count(),
            "split text into chunks"
        );
        drafts
    }
}

/// Splits `text` into ordered windows of at most `max_chunk_size` chars.
///
/// Cuts prefer paragraph, then line, then word boundaries in the back half
/// of each window. Consecutive windows share up to `overlap` chars; the
/// overlap start is moved past a partial word when one is available.
pub fn split(
    text: &str,
    metadata: &Metadata,
    max_chunk_size: usize,
    overlap: usize,
) -> Vec<ChunkDraft> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let max_chunk_size = max_chunk_size.max(1);
    let overlap = overlap.min(max_chunk_size.saturating_sub(1));
    let normalized = text.replace("\r\n", "\n");
    let bounds = char_bounds(&normalized);
    let total = bounds.len() - 1;

    let mut drafts = Vec::new();
    let mut start = 0usize;
    while start < total {
        let hard_end = (start + max_chunk_size).min(total);
        let end = if hard_end == total {
            total
        } else {
            preferred_cut(&normalized, &bounds, start, hard_end)
        };
        if let Some(draft) = build_draft(&normalized, &bounds, start, end, drafts.len(), metadata)
        {
            drafts.push(draft);
        }
        if end == total {
            break;
        }
        start = next_start(&normalized, &bounds, start, end, overlap);
        if let Some(last) = drafts.last() {
            start = start.max(last.char_start + 1);
        }
    }
    drafts
}

/// Hex sha256 of a chunk body; recorded alongside an embedding so unchanged
/// content can be detected later.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn char_bounds(text: &str) -> Vec<usize> {
    text.char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()))
        .collect()
}

fn char_index(bounds: &[usize], byte_pos: usize) -> usize {
    bounds.binary_search(&byte_pos).unwrap_or_else(|idx| idx)
}

fn preferred_cut(text: &str, bounds: &[usize], start: usize, hard_end: usize) -> usize {
    let window = &text[bounds[start]..bounds[hard_end]];
    let floor = start + (hard_end - start) / 2;
    for separator in SEPARATORS {
        if let Some(pos) = window.rfind(separator) {
            let cut = char_index(bounds, bounds[start] + pos + separator.len());
            if cut > floor {
                return cut;
            }
        }
    }
    hard_end
}

fn next_start(text: &str, bounds: &[usize], start: usize, end: usize, overlap: usize) -> usize {
    let candidate = end.saturating_sub(overlap);
    if overlap == 0 || candidate <= start {
        return end;
    }
    let tail = &text[bounds[candidate]..bounds[end]];
    match tail.find(char::is_whitespace) {
        Some(pos) => {
            let after = char_index(bounds, bounds[candidate] + pos) + 1;
            if after < end {
                after
            } else {
                candidate
            }
        }
        None => candidate,
    }
}

fn build_draft(
    text: &str,
    bounds: &[usize],
    start: usize,
    end: usize,
    emitted: usize,
    metadata: &Metadata,
) -> Option<ChunkDraft> {
    if start >= end {
        return None;
    }
    let raw = &text[bounds[start]..bounds[end]];
    let leading = raw.len() - raw.trim_start().len();
    let content = raw.trim();
    if content.is_empty() {
        return None;
    }
    let char_start = char_index(bounds, bounds[start] + leading);
    let char_end = char_start + content.chars().count();
    let ordinal = (emitted + 1) as u32;
    let mut chunk_metadata = metadata.clone();
    chunk_metadata.insert(ORDINAL_KEY.to_string(), ordinal.to_string());
    Some(ChunkDraft {
        content: content.to_string(),
        metadata: chunk_metadata,
        ordinal,
        char_start,
        char_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("tag".to_string(), "faq".to_string());
        metadata
    }

    #[test]
    fn blank_input_yields_no_chunks() {
        assert!(split("", &meta(), 100, 10).is_empty());
        assert!(split("   \n\t  ", &meta(), 100, 10).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let drafts = split("A.\n\nB.", &meta(), 100, 10);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "A.\n\nB.");
        assert_eq!(drafts[0].ordinal, 1);
        assert_eq!(drafts[0].metadata.get("ordinal").unwrap(), "1");
        assert_eq!(drafts[0].metadata.get("tag").unwrap(), "faq");
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let drafts = split(&text, &Metadata::new(), 40, 0);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].content, "a".repeat(30));
        assert_eq!(drafts[1].content, "b".repeat(30));
    }

    #[test]
    fn ordinals_are_dense_and_ordered() {
        let text = "one two three four five six seven eight nine ten ".repeat(20);
        let drafts = split(&text, &Metadata::new(), 50, 10);
        assert!(drafts.len() > 3);
        for (idx, draft) in drafts.iter().enumerate() {
            assert_eq!(draft.ordinal as usize, idx + 1);
            assert!(draft.content.chars().count() <= 50);
        }
        for pair in drafts.windows(2) {
            assert!(pair[0].char_start < pair[1].char_start);
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let text = "word ".repeat(100);
        let drafts = split(&text, &Metadata::new(), 40, 15);
        for pair in drafts.windows(2) {
            assert!(pair[1].char_start < pair[0].char_end);
            assert!(pair[0].char_end - pair[1].char_start <= 15);
        }
    }

    #[test]
    fn overlap_is_clamped_below_chunk_size() {
        let text = "x".repeat(50);
        let drafts = split(&text, &Metadata::new(), 10, 500);
        assert!(!drafts.is_empty());
        assert_eq!(drafts.last().unwrap().char_end, 50);
        for pair in drafts.windows(2) {
            assert!(pair[1].char_start > pair[0].char_start);
        }
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = "café ñandú über ".repeat(30);
        let drafts = split(&text, &Metadata::new(), 17, 4);
        assert!(!drafts.is_empty());
        for draft in &drafts {
            assert!(draft.content.chars().count() <= 17);
        }
    }

    #[test]
    fn chunker_uses_configured_sizes() {
        let chunker = Chunker::new(ChunkConfig {
            chunk_size: 20,
            chunk_overlap: 0,
        });
        let drafts = chunker.split(&"abcd ".repeat(20), &Metadata::new());
        assert!(drafts.iter().all(|d| d.content.chars().count() <= 20));
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello!"));
        assert_eq!(content_hash("hello").len(), 64);
    }
}
