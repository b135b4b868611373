//! Corpus state machine: draft, finalized, vectorized.
//!
//! A corpus is vectorized only when the latest embedding pass over its
//! chunks had no failures. With an embedded index attached, a successful
//! pass also republishes the corpus chunks into the index, and deletion
//! removes them from the index before the rows go.

use std::sync::Arc;

use tracing::{info, warn};

use kbase_core::{Chunker, Embedder, KbError, Result, PARENT_CORPUS_KEY};
use kbase_index::{EmbeddedIndex, IndexDocument};

use crate::store::RelationalStore;
use crate::worker::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorizeReport {
    pub corpus_id: i64,
    pub attempted: usize,
    pub embedded: usize,
    pub failed: usize,
    pub vectorized: bool,
}

pub struct Lifecycle {
    store: RelationalStore,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    index: Option<Arc<EmbeddedIndex>>,
}

impl Lifecycle {
    pub fn new(
        store: RelationalStore,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        index: Option<Arc<EmbeddedIndex>>,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            index,
        }
    }

    pub fn run(&self, job: &Job) -> Result<()> {
        match *job {
            Job::GenerateChunks { corpus_id } => {
                self.generate_chunks(corpus_id)?;
                self.revectorize(corpus_id).map(|_| ())
            }
            Job::Revectorize { corpus_id } => self.revectorize(corpus_id).map(|_| ()),
        }
    }

    /// Re-chunks the corpus text, replacing any earlier chunks.
    pub fn generate_chunks(&self, corpus_id: i64) -> Result<usize> {
        let corpus = self.store.get_corpus(corpus_id)?;
        if !corpus.finalized {
            return Err(KbError::validation(format!(
                "corpus {corpus_id} must be finalized before chunking"
            )));
        }
        let drafts = self
            .chunker
            .split(&corpus.raw_content, &corpus.chunk_metadata());
        let chunks = self.store.upsert_chunks_for_corpus(corpus_id, &drafts)?;
        info!(corpus_id, count = chunks.len(), "generated chunks");
        Ok(chunks.len())
    }

    /// Embeds every chunk still missing a vector, one at a time. Failures are
    /// logged and counted; the corpus is vectorized only if none failed. A
    /// finalized corpus whose chunking never ran is chunked first.
    pub fn revectorize(&self, corpus_id: i64) -> Result<VectorizeReport> {
        let corpus = self.store.get_corpus(corpus_id)?;
        if !corpus.finalized {
            return Err(KbError::validation(format!(
                "corpus {corpus_id} is still a draft"
            )));
        }
        if !corpus.raw_content.trim().is_empty()
            && self.store.chunk_counts(corpus_id)?.total == 0
        {
            warn!(corpus_id, "finalized corpus has no chunks, chunking first");
            self.generate_chunks(corpus_id)?;
        }
        let pending = self.store.pending_chunks(corpus_id)?;
        let mut embedded = 0usize;
        let mut failed = 0usize;
        for chunk_id in &pending {
            match self
                .store
                .generate_embedding(*chunk_id, self.embedder.as_ref())
            {
                Ok(_) => embedded += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        corpus_id,
                        chunk_id = *chunk_id,
                        kind = err.kind(),
                        error = %err,
                        "chunk embedding failed"
                    );
                }
            }
        }

        let vectorized = failed == 0;
        if vectorized && (embedded > 0 || !corpus.vectorized) {
            if let Some(index) = &self.index {
                self.publish(index, corpus_id)?;
            }
        }
        self.store.set_vectorized(corpus_id, vectorized)?;
        info!(
            corpus_id,
            attempted = pending.len(),
            embedded,
            failed,
            vectorized,
            "revectorize pass finished"
        );
        Ok(VectorizeReport {
            corpus_id,
            attempted: pending.len(),
            embedded,
            failed,
            vectorized,
        })
    }

    /// Removes the corpus from the embedded index (when present) and then
    /// from the relational store.
    pub fn delete(&self, corpus_id: i64) -> Result<()> {
        self.store.get_corpus(corpus_id)?;
        if let Some(index) = &self.index {
            let removed = index.remove_by_metadata(PARENT_CORPUS_KEY, &corpus_id.to_string())?;
            info!(corpus_id, removed, "removed corpus from index");
        }
        self.store.delete_corpus(corpus_id)?;
        info!(corpus_id, "deleted corpus");
        Ok(())
    }

    fn publish(&self, index: &EmbeddedIndex, corpus_id: i64) -> Result<()> {
        let key = corpus_id.to_string();
        index.remove_by_metadata(PARENT_CORPUS_KEY, &key)?;
        let documents: Vec<IndexDocument> = self
            .store
            .chunks_for_corpus(corpus_id)?
            .into_iter()
            .map(|chunk| IndexDocument {
                content: chunk.content,
                metadata: chunk.metadata,
                embedding: chunk.embedding,
            })
            .collect();
        if documents.is_empty() {
            return Ok(());
        }
        let report = index.write(documents)?;
        info!(
            corpus_id,
            written = report.ids.len(),
            rejected = report.rejected,
            "published corpus to index"
        );
        Ok(())
    }
}
