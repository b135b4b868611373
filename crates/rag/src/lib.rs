pub mod context;
pub mod embedding;
pub mod engine;
pub mod lifecycle;
pub mod store;
pub mod worker;

pub use context::{assemble_context, RankedChunk, CONTEXT_HEADER};
pub use embedding::{EmbeddingBackend, EmbeddingClient, OllamaEmbeddingClient, OpenAiEmbeddingClient};
pub use engine::{CorpusStatus, Engine};
pub use lifecycle::{Lifecycle, VectorizeReport};
pub use store::{ChunkCounts, RelationalStore, ScoredChunk, SearchFilters};
pub use worker::{Job, JobHandler, WorkerPool};
