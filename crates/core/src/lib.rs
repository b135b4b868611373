mod chunk;
mod config;
mod distance;
mod embedding;
mod error;
mod model;

pub use chunk::{content_hash, split, ChunkConfig, Chunker};
pub use config::{
    AnnParams, Deployment, EmbeddingConfig, EmbeddingProviderKind, EngineConfig, StorageConfig,
    WorkerConfig,
};
pub use distance::{cosine_distance, cosine_similarity, MAX_COSINE_DISTANCE};
pub use embedding::{
    check_dimension, ensure_embeddable, Embedder, HashEmbedder, HashEmbedderConfig,
};
pub use error::{KbError, Result};
pub use model::{
    Chunk, ChunkDraft, Corpus, Metadata, GROUP_KEY, ORDINAL_KEY, PARENT_CORPUS_KEY, TAG_KEY,
};
