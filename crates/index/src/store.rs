//! File-backed vector index shared by every corpus of one embedding
//! configuration.
//!
//! The directory holds `index.hnsw` (bincode graph stamped with its save
//! generation) and `docstore.json` (entry content, metadata and the same
//! generation). Each handle keeps an in-memory mirror;
//! [`EmbeddedIndex::sync`] reloads it from disk. Saves are
//! write-temp-then-rename, graph first. Before a save replaces a graph that
//! matches the docstore, that graph is copied to `index.hnsw.prev`, so a
//! crash between the two renames loads the previous pair instead of failing.
//! Concurrent writers from separate processes are not coordinated: the last
//! save wins, and a handle that notices a newer generation on disk logs a
//! warning before overwriting it.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kbase_core::{check_dimension, AnnParams, Embedder, KbError, Metadata, Result};

use crate::docstore::{DocStore, IndexEntry};
use crate::hnsw::{Candidate, HnswGraph};

pub const INDEX_FILE: &str = "index.hnsw";
pub const DOCSTORE_FILE: &str = "docstore.json";
pub const PREVIOUS_INDEX_FILE: &str = "index.hnsw.prev";

const BOOTSTRAP_CONTENT: &str = "__kbase_bootstrap__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Uninitialized,
    Loading,
    Ready,
}

/// A document handed to [`EmbeddedIndex::write`]. A present `embedding` is
/// stored as-is; otherwise the content is embedded during the write.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub content: String,
    pub metadata: Metadata,
    pub embedding: Option<Vec<f32>>,
}

impl IndexDocument {
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub internal_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub ids: Vec<String>,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub live: usize,
    pub tombstones: usize,
    pub generation: u64,
    pub dimension: usize,
}

struct Mirror {
    graph: HnswGraph,
    docs: DocStore,
    loaded_generation: u64,
}

struct IndexState {
    phase: IndexPhase,
    mirror: Option<Mirror>,
}

#[derive(Deserialize)]
struct GenerationStamp {
    generation: u64,
}

#[derive(Serialize)]
struct GraphFileRef<'a> {
    generation: u64,
    graph: &'a HnswGraph,
}

#[derive(Deserialize)]
struct GraphFile {
    generation: u64,
    graph: HnswGraph,
}

pub struct EmbeddedIndex {
    dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    params: AnnParams,
    state: Mutex<IndexState>,
}

impl EmbeddedIndex {
    /// Loads the index under `dir`, creating and persisting an empty one on
    /// first use.
    pub fn open(
        dir: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        params: AnnParams,
    ) -> Result<Self> {
        let index = Self {
            dir: dir.into(),
            embedder,
            params,
            state: Mutex::new(IndexState {
                phase: IndexPhase::Uninitialized,
                mirror: None,
            }),
        };
        index.sync()?;
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn phase(&self) -> IndexPhase {
        self.state.lock().phase
    }

    /// Replaces the in-memory mirror with the persisted state.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.load_into(&mut state)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let state = self.state.lock();
        let mirror = self.ready(&state)?;
        Ok(IndexStats {
            live: mirror.graph.live_len(),
            tombstones: mirror.graph.tombstones(),
            generation: mirror.loaded_generation,
            dimension: mirror.graph.dimension(),
        })
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.stats()?.live)
    }

    /// Nearest `k` live entries to `query`, closest first.
    pub fn search_by_vector(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        check_dimension(query, self.embedder.dimension())?;
        let state = self.state.lock();
        let mirror = self.ready(&state)?;
        let found = if mirror.graph.live_len() <= self.params.ef_search {
            mirror.graph.exact(query, k, |_| true)
        } else {
            mirror.graph.search(query, k, self.params.ef_search)
        };
        Ok(hits(mirror, found))
    }

    pub fn search_by_text(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query)?;
        self.search_by_vector(&vector, k)
    }

    /// Nearest `k` entries among those whose metadata matches every filter.
    pub fn search_by_vector_filtered(
        &self,
        query: &[f32],
        k: usize,
        filters: &Metadata,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if filters.is_empty() {
            return self.search_by_vector(query, k);
        }
        check_dimension(query, self.embedder.dimension())?;
        let state = self.state.lock();
        let mirror = self.ready(&state)?;
        let allowed = mirror.docs.slots_matching_all(filters);
        let found = mirror
            .graph
            .exact(query, k, |slot| allowed.contains(&slot));
        Ok(hits(mirror, found))
    }

    /// Content of up to `k` entries matching every filter, in insertion
    /// order. An empty filter map matches nothing.
    pub fn search_by_metadata(&self, filters: &Metadata, k: usize) -> Result<Vec<String>> {
        if k == 0 || filters.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        let mirror = self.ready(&state)?;
        Ok(mirror
            .docs
            .slots_matching_all(filters)
            .into_iter()
            .filter_map(|slot| mirror.docs.get(slot))
            .take(k)
            .map(|entry| entry.content.clone())
            .collect())
    }

    pub fn ids_for_metadata(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mirror = self.ready(&state)?;
        Ok(mirror
            .docs
            .slots_matching(key, value)
            .into_iter()
            .filter_map(|slot| mirror.docs.get(slot))
            .map(|entry| entry.internal_id.clone())
            .collect())
    }

    /// Adds a batch and persists it. Invalid documents are skipped and
    /// counted; a batch with no valid document is an error.
    pub fn write(&self, documents: Vec<IndexDocument>) -> Result<WriteReport> {
        let dimension = self.embedder.dimension();
        let mut rejected = 0usize;
        let mut valid = Vec::with_capacity(documents.len());
        for document in documents {
            match validate_document(&document, dimension) {
                Ok(()) => valid.push(document),
                Err(err) => {
                    rejected += 1;
                    warn!(error = %err, "rejected index document");
                }
            }
        }
        if valid.is_empty() {
            return Err(KbError::validation(format!(
                "no valid documents in batch ({rejected} rejected)"
            )));
        }

        let texts: Vec<String> = valid
            .iter()
            .filter(|doc| doc.embedding.is_none())
            .map(|doc| doc.content.clone())
            .collect();
        let fresh = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed_many(&texts)?
        };
        if fresh.len() != texts.len() {
            return Err(KbError::embedding(format!(
                "backend returned {} vectors for {} inputs",
                fresh.len(),
                texts.len()
            )));
        }
        let mut fresh = fresh.into_iter();
        let mut prepared = Vec::with_capacity(valid.len());
        for document in valid {
            let vector = match document.embedding {
                Some(vector) => vector,
                None => fresh
                    .next()
                    .ok_or_else(|| KbError::embedding("backend returned too few vectors"))?,
            };
            check_dimension(&vector, dimension)?;
            prepared.push((document.content, document.metadata, vector));
        }

        let mut state = self.state.lock();
        let mirror = self.ready_mut(&mut state)?;
        match self.insert_batch(mirror, prepared) {
            Ok(ids) => {
                info!(written = ids.len(), rejected, "wrote index batch");
                Ok(WriteReport { ids, rejected })
            }
            Err(err) => {
                self.discard_unsaved(&mut state);
                Err(err)
            }
        }
    }

    fn insert_batch(
        &self,
        mirror: &mut Mirror,
        prepared: Vec<(String, Metadata, Vec<f32>)>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(prepared.len());
        for (content, metadata, vector) in prepared {
            let slot = mirror.graph.insert(vector)?;
            let internal_id = Uuid::new_v4().to_string();
            mirror.docs.insert(
                slot,
                IndexEntry {
                    internal_id: internal_id.clone(),
                    content,
                    metadata,
                },
            );
            ids.push(internal_id);
        }
        self.persist(mirror)?;
        debug!(live = mirror.graph.live_len(), "index batch saved");
        Ok(ids)
    }

    /// Deletes every entry whose metadata `key` equals `value`. Reloads from
    /// disk first so entries written by other handles are seen.
    pub fn remove_by_metadata(&self, key: &str, value: &str) -> Result<usize> {
        let mut state = self.state.lock();
        self.load_into(&mut state)?;
        let mirror = self.ready_mut(&mut state)?;
        let slots: Vec<u32> = mirror
            .docs
            .slots_matching(key, value)
            .into_iter()
            .filter(|slot| mirror.graph.contains(*slot))
            .collect();
        let removed = self.remove_slots(mirror, slots, key, value);
        if removed.is_err() {
            self.discard_unsaved(&mut state);
        }
        removed
    }

    pub fn remove_by_ids(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.lock();
        self.load_into(&mut state)?;
        let mirror = self.ready_mut(&mut state)?;
        let slots: Vec<u32> = ids
            .iter()
            .filter_map(|id| mirror.docs.slot_of(id))
            .filter(|slot| mirror.graph.contains(*slot))
            .collect();
        let removed = self.remove_slots(mirror, slots, "internal_id", "*");
        if removed.is_err() {
            self.discard_unsaved(&mut state);
        }
        removed
    }

    fn remove_slots(
        &self,
        mirror: &mut Mirror,
        slots: Vec<u32>,
        key: &str,
        value: &str,
    ) -> Result<usize> {
        if slots.is_empty() {
            debug!(key, value, "no index entries to remove");
            return Ok(0);
        }
        for slot in &slots {
            mirror.graph.mark_deleted(*slot);
            mirror.docs.remove(*slot);
        }
        self.persist(mirror)?;
        info!(key, value, removed = slots.len(), "removed index entries");
        Ok(slots.len())
    }

    /// Drops in-memory changes whose save failed by reloading from disk. If
    /// that fails too the handle stays unloaded until the next `sync`.
    fn discard_unsaved(&self, state: &mut IndexState) {
        if let Err(err) = self.load_into(state) {
            warn!(
                dir = %self.dir.display(),
                error = %err,
                "could not reload index after failed save"
            );
            state.mirror = None;
            state.phase = IndexPhase::Uninitialized;
        }
    }

    fn ready<'a>(&self, state: &'a IndexState) -> Result<&'a Mirror> {
        match (&state.phase, &state.mirror) {
            (IndexPhase::Ready, Some(mirror)) => Ok(mirror),
            _ => Err(KbError::index_io(&self.dir, "index is not loaded")),
        }
    }

    fn ready_mut<'a>(&self, state: &'a mut IndexState) -> Result<&'a mut Mirror> {
        match (&state.phase, &mut state.mirror) {
            (IndexPhase::Ready, Some(mirror)) => Ok(mirror),
            _ => Err(KbError::index_io(&self.dir, "index is not loaded")),
        }
    }

    fn load_into(&self, state: &mut IndexState) -> Result<()> {
        let previous = state.phase;
        state.phase = IndexPhase::Loading;
        let loaded = if self.dir.join(INDEX_FILE).exists() {
            self.read_disk()
        } else {
            self.bootstrap()
        };
        match loaded {
            Ok(mirror) => {
                state.mirror = Some(mirror);
                state.phase = IndexPhase::Ready;
                Ok(())
            }
            Err(err) => {
                state.phase = if previous == IndexPhase::Ready {
                    IndexPhase::Ready
                } else {
                    IndexPhase::Uninitialized
                };
                Err(err)
            }
        }
    }

    fn read_disk(&self) -> Result<Mirror> {
        let index_path = self.dir.join(INDEX_FILE);
        let docs_path = self.dir.join(DOCSTORE_FILE);
        let raw = fs::read(&docs_path).map_err(|err| KbError::index_io(&docs_path, err))?;
        let mut docs: DocStore =
            serde_json::from_slice(&raw).map_err(|err| KbError::index_io(&docs_path, err))?;
        docs.reindex();
        let graph = self.graph_for(&docs)?;

        let expected = self.embedder.dimension();
        if docs.dimension != expected || graph.dimension() != expected {
            return Err(KbError::validation(format!(
                "index at {} holds {}-dimensional vectors, embedder produces {expected}",
                self.dir.display(),
                graph.dimension()
            )));
        }
        if docs.model != self.embedder.model() {
            warn!(
                stored = %docs.model,
                configured = %self.embedder.model(),
                "index was built with a different embedding model"
            );
        }
        if docs.len() != graph.live_len() || docs.slots().any(|slot| !graph.contains(slot)) {
            return Err(KbError::index_io(
                &docs_path,
                "docstore does not match the graph",
            ));
        }
        debug!(
            dir = %self.dir.display(),
            live = docs.len(),
            generation = docs.generation,
            "loaded embedded index"
        );
        Ok(Mirror {
            loaded_generation: docs.generation,
            graph,
            docs,
        })
    }

    /// The saved graph whose generation matches `docs`. A mismatch means a
    /// save stopped between its two renames; the previous graph is used then.
    fn graph_for(&self, docs: &DocStore) -> Result<HnswGraph> {
        let index_path = self.dir.join(INDEX_FILE);
        let current = read_graph(&index_path)?;
        if current.generation == docs.generation {
            return Ok(current.graph);
        }
        let previous_path = self.dir.join(PREVIOUS_INDEX_FILE);
        match read_graph(&previous_path) {
            Ok(previous) if previous.generation == docs.generation => {
                warn!(
                    dir = %self.dir.display(),
                    graph_generation = current.generation,
                    docstore_generation = docs.generation,
                    "recovering index from an interrupted save"
                );
                Ok(previous.graph)
            }
            _ => Err(KbError::index_io(
                &index_path,
                format!(
                    "graph generation {} does not match docstore generation {}",
                    current.generation, docs.generation
                ),
            )),
        }
    }

    /// First-use setup: one placeholder entry is inserted and immediately
    /// removed so the persisted graph carries its parameters.
    fn bootstrap(&self) -> Result<Mirror> {
        let dimension = self.embedder.dimension();
        if dimension == 0 {
            return Err(KbError::validation("embedding dimension must be positive"));
        }
        fs::create_dir_all(&self.dir).map_err(|err| KbError::index_io(&self.dir, err))?;
        let mut graph = HnswGraph::new(dimension, self.params);
        let mut docs = DocStore::new(self.embedder.model(), dimension);

        let mut placeholder = vec![0.0; dimension];
        placeholder[0] = 1.0;
        let slot = graph.insert(placeholder)?;
        docs.insert(
            slot,
            IndexEntry {
                internal_id: Uuid::new_v4().to_string(),
                content: BOOTSTRAP_CONTENT.to_string(),
                metadata: Metadata::new(),
            },
        );
        graph.mark_deleted(slot);
        docs.remove(slot);

        let mut mirror = Mirror {
            graph: graph.compacted(),
            docs,
            loaded_generation: 0,
        };
        self.persist(&mut mirror)?;
        info!(dir = %self.dir.display(), dimension, "created embedded index");
        Ok(mirror)
    }

    fn disk_generation(&self) -> Option<u64> {
        let raw = fs::read(self.dir.join(DOCSTORE_FILE)).ok()?;
        serde_json::from_slice::<GenerationStamp>(&raw)
            .ok()
            .map(|stamp| stamp.generation)
    }

    fn persist(&self, mirror: &mut Mirror) -> Result<()> {
        let on_disk = self.disk_generation();
        if let Some(generation) = on_disk {
            if generation > mirror.loaded_generation {
                warn!(
                    dir = %self.dir.display(),
                    on_disk = generation,
                    loaded = mirror.loaded_generation,
                    "overwriting index saved by another writer"
                );
            }
        }
        if mirror.graph.tombstones() > mirror.graph.live_len() {
            debug!(
                tombstones = mirror.graph.tombstones(),
                live = mirror.graph.live_len(),
                "compacting index graph"
            );
            mirror.graph = mirror.graph.compacted();
        }
        let generation = on_disk.unwrap_or(0).max(mirror.loaded_generation) + 1;
        mirror.docs.generation = generation;

        let index_path = self.dir.join(INDEX_FILE);
        let docs_path = self.dir.join(DOCSTORE_FILE);
        let graph_bytes = bincode::serialize(&GraphFileRef {
            generation,
            graph: &mirror.graph,
        })
        .map_err(|err| KbError::index_io(&index_path, err))?;
        let docs_bytes =
            serde_json::to_vec(&mirror.docs).map_err(|err| KbError::index_io(&docs_path, err))?;
        if on_disk.is_some() && graph_generation(&index_path) == on_disk {
            let previous_path = self.dir.join(PREVIOUS_INDEX_FILE);
            fs::copy(&index_path, &previous_path)
                .map_err(|err| KbError::index_io(&previous_path, err))?;
        }
        write_atomically(&index_path, &graph_bytes)?;
        write_atomically(&docs_path, &docs_bytes)?;
        if !index_path.exists() || !docs_path.exists() {
            return Err(KbError::index_io(&index_path, "index files missing after save"));
        }
        mirror.loaded_generation = generation;
        Ok(())
    }
}

fn validate_document(document: &IndexDocument, dimension: usize) -> Result<()> {
    if document.content.trim().is_empty() {
        return Err(KbError::validation("document content is blank"));
    }
    if document.metadata.keys().any(|key| key.trim().is_empty()) {
        return Err(KbError::validation("document metadata has a blank key"));
    }
    if let Some(vector) = &document.embedding {
        check_dimension(vector, dimension)?;
    }
    Ok(())
}

fn hits(mirror: &Mirror, found: Vec<Candidate>) -> Vec<SearchHit> {
    found
        .into_iter()
        .filter_map(|candidate| {
            mirror.docs.get(candidate.id).map(|entry| SearchHit {
                internal_id: entry.internal_id.clone(),
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
                distance: candidate.distance,
            })
        })
        .collect()
}

fn read_graph(path: &Path) -> Result<GraphFile> {
    let bytes = fs::read(path).map_err(|err| KbError::index_io(path, err))?;
    bincode::deserialize(&bytes).map_err(|err| KbError::index_io(path, err))
}

/// Reads only the generation stamp at the head of a graph file.
fn graph_generation(path: &Path) -> Option<u64> {
    let file = File::open(path).ok()?;
    bincode::deserialize_from(BufReader::new(file)).ok()
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|err| KbError::index_io(&tmp, err))?;
    fs::rename(&tmp, path).map_err(|err| KbError::index_io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::{HashEmbedder, HashEmbedderConfig};
    use tempfile::TempDir;

    fn embedder(dimensions: usize) -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::new(HashEmbedderConfig {
            dimensions,
            seed: 7,
        }))
    }

    fn open(dir: &TempDir) -> EmbeddedIndex {
        EmbeddedIndex::open(dir.path(), embedder(32), AnnParams::default()).unwrap()
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn first_open_bootstraps_an_empty_index() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        assert_eq!(index.phase(), IndexPhase::Ready);
        assert!(dir.path().join(INDEX_FILE).exists());
        assert!(dir.path().join(DOCSTORE_FILE).exists());
        let stats = index.stats().unwrap();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.tombstones, 0);
        assert_eq!(stats.generation, 1);
        assert!(index.search_by_text("anything", 5).unwrap().is_empty());
    }

    #[test]
    fn metadata_roundtrip_returns_every_entry() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let docs = (0..5)
            .map(|i| {
                IndexDocument::new(format!("entry number {i}"), meta(&[("batch", "one")]))
            })
            .collect();
        let report = index.write(docs).unwrap();
        assert_eq!(report.ids.len(), 5);
        assert_eq!(report.rejected, 0);

        let found = index
            .search_by_metadata(&meta(&[("batch", "one")]), 5)
            .unwrap();
        assert_eq!(found.len(), 5);
        assert_eq!(found[0], "entry number 0");
        assert_eq!(found[4], "entry number 4");
    }

    #[test]
    fn zero_k_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![IndexDocument::new("hello world", meta(&[("a", "b")]))])
            .unwrap();
        assert!(index.search_by_vector(&[1.0, 2.0], 0).unwrap().is_empty());
        assert!(index.search_by_metadata(&meta(&[("a", "b")]), 0).unwrap().is_empty());
    }

    #[test]
    fn query_dimension_is_checked() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let err = index.search_by_vector(&[1.0, 0.0], 3).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn removing_unmatched_metadata_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![
                IndexDocument::new("alpha", meta(&[("parent_corpus_id", "1")])),
                IndexDocument::new("beta", meta(&[("parent_corpus_id", "1")])),
            ])
            .unwrap();
        assert_eq!(index.remove_by_metadata("parent_corpus_id", "99").unwrap(), 0);
        assert_eq!(index.len().unwrap(), 2);
    }

    #[test]
    fn removal_is_visible_after_reopen() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![
                IndexDocument::new("alpha", meta(&[("parent_corpus_id", "1")])),
                IndexDocument::new("beta", meta(&[("parent_corpus_id", "2")])),
                IndexDocument::new("gamma", meta(&[("parent_corpus_id", "1")])),
            ])
            .unwrap();
        assert_eq!(index.remove_by_metadata("parent_corpus_id", "1").unwrap(), 2);

        let reopened = open(&dir);
        assert_eq!(reopened.len().unwrap(), 1);
        let remaining = reopened
            .search_by_metadata(&meta(&[("parent_corpus_id", "2")]), 10)
            .unwrap();
        assert_eq!(remaining, vec!["beta".to_string()]);
        assert!(reopened
            .ids_for_metadata("parent_corpus_id", "1")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn metadata_filters_intersect_across_writes() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![IndexDocument::new("first batch", meta(&[("batch", "one")]))])
            .unwrap();
        index
            .write(vec![IndexDocument::new("billing note", meta(&[("topic", "billing")]))])
            .unwrap();
        let both = meta(&[("batch", "one"), ("topic", "billing")]);
        assert!(index.search_by_metadata(&both, 10).unwrap().is_empty());

        index
            .write(vec![IndexDocument::new(
                "billing in batch one",
                meta(&[("batch", "one"), ("topic", "billing")]),
            )])
            .unwrap();
        assert_eq!(
            index.search_by_metadata(&both, 10).unwrap(),
            vec!["billing in batch one".to_string()]
        );
        assert!(index.search_by_metadata(&Metadata::new(), 10).unwrap().is_empty());
    }

    #[test]
    fn invalid_documents_are_counted_or_fatal() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let err = index
            .write(vec![IndexDocument::new("   ", Metadata::new())])
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let report = index
            .write(vec![
                IndexDocument::new("kept", Metadata::new()),
                IndexDocument::new("wrong size", Metadata::new()).with_embedding(vec![1.0; 3]),
            ])
            .unwrap();
        assert_eq!(report.ids.len(), 1);
        assert_eq!(report.rejected, 1);
    }

    #[test]
    fn nearest_entry_ranks_first() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let mut a = vec![0.0; 32];
        a[1] = 1.0;
        let mut b = vec![0.0; 32];
        b[2] = 1.0;
        index
            .write(vec![
                IndexDocument::new("a", Metadata::new()).with_embedding(a.clone()),
                IndexDocument::new("b", Metadata::new()).with_embedding(b),
            ])
            .unwrap();
        let hits = index.search_by_vector(&a, 2).unwrap();
        assert_eq!(hits[0].content, "a");
        assert!(hits[0].distance < 1e-5);
        assert!((hits[1].distance - 1.0).abs() < 1e-5);

        let filtered = index
            .search_by_vector_filtered(&a, 2, &meta(&[("missing", "x")]))
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn sync_sees_other_handles_writes() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir);
        let second = open(&dir);
        first
            .write(vec![IndexDocument::new("shared", meta(&[("k", "v")]))])
            .unwrap();
        assert_eq!(second.len().unwrap(), 0);
        second.sync().unwrap();
        assert_eq!(second.len().unwrap(), 1);
        assert_eq!(second.stats().unwrap().generation, first.stats().unwrap().generation);
    }

    #[test]
    fn reopening_with_another_dimension_fails() {
        let dir = TempDir::new().unwrap();
        drop(open(&dir));
        let err = EmbeddedIndex::open(dir.path(), embedder(16), AnnParams::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn entries_can_be_removed_by_internal_id() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let report = index
            .write(vec![
                IndexDocument::new("alpha", meta(&[("k", "v")])),
                IndexDocument::new("beta", meta(&[("k", "v")])),
            ])
            .unwrap();
        let removed = index
            .remove_by_ids(&[report.ids[0].clone(), "not-an-id".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.remove_by_ids(&[report.ids[0].clone()]).unwrap(), 0);

        let reopened = open(&dir);
        assert_eq!(
            reopened.ids_for_metadata("k", "v").unwrap(),
            vec![report.ids[1].clone()]
        );
    }

    #[test]
    fn interrupted_save_falls_back_to_previous_graph() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![IndexDocument::new("first", meta(&[("batch", "1")]))])
            .unwrap();
        let docstore = dir.path().join(DOCSTORE_FILE);
        let committed = fs::read(&docstore).unwrap();
        index
            .write(vec![IndexDocument::new("second", meta(&[("batch", "2")]))])
            .unwrap();
        drop(index);
        // graph renamed, docstore rename never happened
        fs::write(&docstore, committed).unwrap();

        let reopened = open(&dir);
        assert_eq!(reopened.len().unwrap(), 1);
        assert_eq!(
            reopened.search_by_metadata(&meta(&[("batch", "1")]), 5).unwrap(),
            vec!["first".to_string()]
        );
        reopened
            .write(vec![IndexDocument::new("third", meta(&[("batch", "3")]))])
            .unwrap();
        assert_eq!(open(&dir).len().unwrap(), 2);
    }

    #[test]
    fn unmatched_graph_without_fallback_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let docstore = dir.path().join(DOCSTORE_FILE);
        let committed = fs::read(&docstore).unwrap();
        for batch in ["1", "2"] {
            index
                .write(vec![IndexDocument::new("entry", meta(&[("batch", batch)]))])
                .unwrap();
        }
        drop(index);
        fs::write(&docstore, committed).unwrap();
        let err = EmbeddedIndex::open(dir.path(), embedder(32), AnnParams::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "index_io");
    }

    #[test]
    fn failed_save_leaves_no_unsaved_entries() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        index
            .write(vec![IndexDocument::new("saved", Metadata::new())])
            .unwrap();
        let blocker = dir.path().join(INDEX_FILE).with_extension("tmp");
        fs::create_dir(&blocker).unwrap();

        let err = index
            .write(vec![IndexDocument::new("unsaved", Metadata::new())])
            .unwrap_err();
        assert_eq!(err.kind(), "index_io");
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.search_by_text("unsaved", 5).unwrap()[0].content, "saved");

        fs::remove_dir(&blocker).unwrap();
        index
            .write(vec![IndexDocument::new("unsaved", Metadata::new())])
            .unwrap();
        assert_eq!(open(&dir).len().unwrap(), 2);
    }

    #[test]
    fn heavy_deletion_compacts_on_save() {
        let dir = TempDir::new().unwrap();
        let index = open(&dir);
        let docs = (0..6)
            .map(|i| {
                let group = if i == 0 { "keep" } else { "drop" };
                IndexDocument::new(format!("doc {i}"), meta(&[("g", group)]))
            })
            .collect();
        index.write(docs).unwrap();
        assert_eq!(index.remove_by_metadata("g", "drop").unwrap(), 5);
        let stats = index.stats().unwrap();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.tombstones, 0);
        assert_eq!(
            index.search_by_text("doc 0", 3).unwrap()[0].content,
            "doc 0"
        );
    }
}
