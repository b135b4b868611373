mod docstore;
mod hnsw;
mod store;

pub use docstore::{DocStore, IndexEntry};
pub use hnsw::{Candidate, HnswGraph};
pub use store::{
    EmbeddedIndex, IndexDocument, IndexPhase, IndexStats, SearchHit, WriteReport, DOCSTORE_FILE,
    INDEX_FILE, PREVIOUS_INDEX_FILE,
};
