use std::sync::Arc;

use tracing::{debug, info};

use kbase_core::{
    Chunker, Corpus, Deployment, Embedder, EngineConfig, KbError, Metadata, Result, GROUP_KEY,
    TAG_KEY,
};
use kbase_index::{EmbeddedIndex, IndexStats, SearchHit};

use crate::context::{assemble_context, RankedChunk};
use crate::embedding::EmbeddingClient;
use crate::lifecycle::{Lifecycle, VectorizeReport};
use crate::store::{ChunkCounts, RelationalStore, SearchFilters};
use crate::worker::{Job, JobHandler, WorkerPool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusStatus {
    pub corpus: Corpus,
    pub chunks: ChunkCounts,
}

/// Entry point for callers: corpus lifecycle plus retrieval, wired from one
/// [`EngineConfig`].
pub struct Engine {
    config: EngineConfig,
    store: RelationalStore,
    embedder: Arc<dyn Embedder>,
    index: Option<Arc<EmbeddedIndex>>,
    lifecycle: Arc<Lifecycle>,
    pool: WorkerPool,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let embedder = Arc::new(EmbeddingClient::from_config(&config.embedding)?);
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        if embedder.dimension() != config.embedding.dimension {
            return Err(KbError::Config(format!(
                "embedder produces {}-dimensional vectors, configuration says {}",
                embedder.dimension(),
                config.embedding.dimension
            )));
        }
        let store = RelationalStore::open(&config.storage.database, embedder.dimension())?;
        let index = match config.storage.deployment {
            Deployment::Embedded => Some(Arc::new(EmbeddedIndex::open(
                config.storage.index_dir.clone(),
                Arc::clone(&embedder),
                config.ann,
            )?)),
            Deployment::Relational => None,
        };
        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            Arc::clone(&embedder),
            Chunker::new(config.chunking),
            index.clone(),
        ));
        let worker = Arc::clone(&lifecycle);
        let handler: Arc<JobHandler> = Arc::new(move |job: &Job| worker.run(job));
        let pool = WorkerPool::start(config.workers.threads, handler);
        info!(
            database = %config.storage.database.display(),
            deployment = ?config.storage.deployment,
            model = %embedder.model(),
            "engine ready"
        );
        Ok(Self {
            config,
            store,
            embedder,
            index,
            lifecycle,
            pool,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn create_corpus(&self, tag: &str, group: &str) -> Result<Corpus> {
        self.store.create_corpus(tag, group)
    }

    pub fn corpus(&self, corpus_id: i64) -> Result<Corpus> {
        self.store.get_corpus(corpus_id)
    }

    pub fn corpus_status(&self, corpus_id: i64) -> Result<CorpusStatus> {
        Ok(CorpusStatus {
            corpus: self.store.get_corpus(corpus_id)?,
            chunks: self.store.chunk_counts(corpus_id)?,
        })
    }

    /// Stores raw training text on a draft corpus.
    pub fn ingest(&self, corpus_id: i64, raw_text: &str) -> Result<()> {
        self.store.set_raw_content(corpus_id, raw_text)?;
        debug!(corpus_id, chars = raw_text.chars().count(), "ingested corpus text");
        Ok(())
    }

    /// Locks the corpus and queues chunking and embedding. Finalizing twice
    /// is a no-op and returns `false`.
    pub fn finalize(&self, corpus_id: i64) -> Result<bool> {
        if !self.store.mark_finalized(corpus_id)? {
            debug!(corpus_id, "corpus already finalized");
            return Ok(false);
        }
        self.pool.submit(Job::GenerateChunks { corpus_id })?;
        info!(corpus_id, "corpus finalized");
        Ok(true)
    }

    pub fn revectorize(&self, corpus_id: i64) -> Result<VectorizeReport> {
        self.lifecycle.revectorize(corpus_id)
    }

    pub fn schedule_revectorize(&self, corpus_id: i64) -> Result<()> {
        self.store.get_corpus(corpus_id)?;
        self.pool.submit(Job::Revectorize { corpus_id })
    }

    pub fn delete(&self, corpus_id: i64) -> Result<()> {
        self.lifecycle.delete(corpus_id)
    }

    /// Blocks until every queued job has finished.
    pub fn wait_idle(&self) {
        self.pool.wait_idle();
    }

    /// Most relevant chunks for `query`, formatted as a context block.
    pub fn retrieve(&self, query: &str, k: usize, filters: &SearchFilters) -> Result<String> {
        let ranked = self.rank(query, k, filters)?;
        Ok(assemble_context(&ranked))
    }

    pub fn rank(&self, query: &str, k: usize, filters: &SearchFilters) -> Result<Vec<RankedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query)?;
        let ranked = match &self.index {
            Some(index) => index
                .search_by_vector_filtered(&vector, k, &metadata_filters(filters))?
                .into_iter()
                .map(ranked_from_hit)
                .collect(),
            None => self
                .store
                .similarity_search(&vector, k, filters)?
                .into_iter()
                .map(RankedChunk::from)
                .collect(),
        };
        Ok(ranked)
    }

    /// Reloads the embedded index so writes from other processes are seen.
    pub fn sync_index(&self) -> Result<()> {
        match &self.index {
            Some(index) => index.sync(),
            None => Ok(()),
        }
    }

    pub fn index_stats(&self) -> Result<Option<IndexStats>> {
        self.index.as_ref().map(|index| index.stats()).transpose()
    }

    pub fn search_index(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| KbError::validation("the relational deployment has no embedded index"))?;
        index.search_by_text(query, k)
    }
}

fn metadata_filters(filters: &SearchFilters) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(tag) = &filters.tag {
        metadata.insert(TAG_KEY.to_string(), tag.clone());
    }
    if let Some(group) = &filters.group {
        metadata.insert(GROUP_KEY.to_string(), group.clone());
    }
    metadata
}

fn ranked_from_hit(hit: SearchHit) -> RankedChunk {
    let label = |key: &str| hit.metadata.get(key).cloned().unwrap_or_default();
    RankedChunk {
        tag: label(TAG_KEY),
        group: label(GROUP_KEY),
        content: hit.content,
        distance: hit.distance,
    }
}
