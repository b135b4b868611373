use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Metadata = BTreeMap<String, String>;

pub const PARENT_CORPUS_KEY: &str = "parent_corpus_id";
pub const TAG_KEY: &str = "tag";
pub const GROUP_KEY: &str = "group";
pub const ORDINAL_KEY: &str = "ordinal";

/// A chunk produced by the chunker, before it is persisted or embedded.
///
/// `char_start`/`char_end` locate the trimmed content in the normalized
/// source text, measured in chars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub content: String,
    pub metadata: Metadata,
    pub ordinal: u32,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub corpus_id: i64,
    pub content: String,
    pub metadata: Metadata,
    pub ordinal: u32,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn is_embedded(&self) -> bool {
        self.embedding.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corpus {
    pub id: i64,
    pub tag: String,
    pub group: String,
    pub raw_content: String,
    pub finalized: bool,
    pub vectorized: bool,
}

impl Corpus {
    /// Provenance stamped on every chunk of this corpus.
    pub fn chunk_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert(PARENT_CORPUS_KEY.to_string(), self.id.to_string());
        metadata.insert(TAG_KEY.to_string(), self.tag.clone());
        metadata.insert(GROUP_KEY.to_string(), self.group.clone());
        metadata
    }
}
