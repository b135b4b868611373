use std::path::{Path, PathBuf};
use std::time::Duration;

use bytemuck::{allocation::pod_collect_to_vec, cast_slice};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use kbase_core::{
    check_dimension, content_hash, cosine_distance, Chunk, ChunkDraft, Corpus, Embedder, KbError,
    Metadata, Result,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed corpora and chunk rows.
///
/// Each call opens its own connection; writes scoped to one corpus run in a
/// single transaction. Ranking uses a `cosine_distance(blob, blob)` SQL
/// function registered on every connection.
#[derive(Clone)]
pub struct RelationalStore {
    path: PathBuf,
    dimension: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub tag: Option<String>,
    pub group: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.tag.is_none() && self.group.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: i64,
    pub corpus_id: i64,
    pub ordinal: u32,
    pub content: String,
    pub tag: String,
    pub group: String,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCounts {
    pub total: usize,
    pub embedded: usize,
}

pub(crate) fn db(err: rusqlite::Error) -> KbError {
    KbError::Storage(err.to_string())
}

impl RelationalStore {
    pub fn open<P: AsRef<Path>>(path: P, dimension: usize) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            dimension,
        };
        store.init()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(db)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db)?;
        conn.create_scalar_function(
            "cosine_distance",
            2,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let left: Option<Vec<u8>> = ctx.get(0)?;
                let right: Option<Vec<u8>> = ctx.get(1)?;
                let distance = match (left, right) {
                    (Some(left), Some(right)) => {
                        cosine_distance(&decode_vector(&left), &decode_vector(&right))
                    }
                    _ => kbase_core::MAX_COSINE_DISTANCE,
                };
                Ok(f64::from(distance))
            },
        )
        .map_err(db)?;
        Ok(conn)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS corpora (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag TEXT NOT NULL,
                group_name TEXT NOT NULL,
                raw_content TEXT NOT NULL DEFAULT '',
                finalized INTEGER NOT NULL DEFAULT 0,
                vectorized INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                CHECK (tag <> group_name)
            );
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                corpus_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding BLOB,
                content_hash TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(corpus_id) REFERENCES corpora(id) ON DELETE CASCADE,
                UNIQUE(corpus_id, ordinal)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_corpus ON chunks(corpus_id);
            "#,
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn create_corpus(&self, tag: &str, group: &str) -> Result<Corpus> {
        let (tag, group) = (tag.trim(), group.trim());
        if tag.is_empty() || group.is_empty() {
            return Err(KbError::validation("corpus tag and group must not be blank"));
        }
        if tag == group {
            return Err(KbError::validation(format!(
                "corpus tag and group must differ (both are {tag:?})"
            )));
        }
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO corpora (tag, group_name) VALUES (?1, ?2)",
            params![tag, group],
        )
        .map_err(db)?;
        let id = conn.last_insert_rowid();
        debug!(corpus_id = id, tag, group, "created corpus");
        Ok(Corpus {
            id,
            tag: tag.to_string(),
            group: group.to_string(),
            raw_content: String::new(),
            finalized: false,
            vectorized: false,
        })
    }

    pub fn get_corpus(&self, corpus_id: i64) -> Result<Corpus> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id, tag, group_name, raw_content, finalized, vectorized FROM corpora WHERE id = ?1",
            [corpus_id],
            |row| {
                Ok(Corpus {
                    id: row.get(0)?,
                    tag: row.get(1)?,
                    group: row.get(2)?,
                    raw_content: row.get(3)?,
                    finalized: row.get(4)?,
                    vectorized: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| KbError::not_found("corpus", corpus_id))
    }

    /// Replaces the raw text of a draft corpus.
    pub fn set_raw_content(&self, corpus_id: i64, raw_content: &str) -> Result<()> {
        let corpus = self.get_corpus(corpus_id)?;
        if corpus.finalized {
            return Err(KbError::validation(format!(
                "corpus {corpus_id} is finalized; its content is locked"
            )));
        }
        let conn = self.connection()?;
        conn.execute(
            "UPDATE corpora SET raw_content = ?1 WHERE id = ?2",
            params![raw_content, corpus_id],
        )
        .map_err(db)?;
        Ok(())
    }

    /// Returns `false` when the corpus was already finalized.
    pub fn mark_finalized(&self, corpus_id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE corpora SET finalized = 1 WHERE id = ?1 AND finalized = 0",
                [corpus_id],
            )
            .map_err(db)?;
        if changed == 1 {
            return Ok(true);
        }
        self.get_corpus(corpus_id).map(|_| false)
    }

    pub fn set_vectorized(&self, corpus_id: i64, vectorized: bool) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE corpora SET vectorized = ?1 WHERE id = ?2",
                params![vectorized, corpus_id],
            )
            .map_err(db)?;
        if changed == 0 {
            return Err(KbError::not_found("corpus", corpus_id));
        }
        Ok(())
    }

    /// Deletes the corpus; its chunk rows go with it.
    pub fn delete_corpus(&self, corpus_id: i64) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn
            .execute("DELETE FROM corpora WHERE id = ?1", [corpus_id])
            .map_err(db)?;
        if changed == 0 {
            return Err(KbError::not_found("corpus", corpus_id));
        }
        Ok(())
    }

    /// Replaces every chunk row of the corpus with `drafts`, numbered
    /// `1..=n` and without embeddings. Clears the vectorized flag.
    pub fn upsert_chunks_for_corpus(
        &self,
        corpus_id: i64,
        drafts: &[ChunkDraft],
    ) -> Result<Vec<Chunk>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(db)?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM corpora WHERE id = ?1", [corpus_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db)?;
        if exists.is_none() {
            return Err(KbError::not_found("corpus", corpus_id));
        }
        tx.execute("DELETE FROM chunks WHERE corpus_id = ?1", [corpus_id])
            .map_err(db)?;
        tx.execute(
            "UPDATE corpora SET vectorized = 0 WHERE id = ?1",
            [corpus_id],
        )
        .map_err(db)?;
        let mut chunks = Vec::with_capacity(drafts.len());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO chunks (corpus_id, ordinal, content, metadata) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db)?;
            for (idx, draft) in drafts.iter().enumerate() {
                let ordinal = (idx + 1) as u32;
                let metadata = serde_json::to_string(&draft.metadata)?;
                stmt.execute(params![corpus_id, ordinal, draft.content, metadata])
                    .map_err(db)?;
                chunks.push(Chunk {
                    id: tx.last_insert_rowid(),
                    corpus_id,
                    content: draft.content.clone(),
                    metadata: draft.metadata.clone(),
                    ordinal,
                    embedding: None,
                });
            }
        }
        tx.commit().map_err(db)?;
        debug!(corpus_id, count = chunks.len(), "replaced corpus chunks");
        Ok(chunks)
    }

    pub fn chunks_for_corpus(&self, corpus_id: i64) -> Result<Vec<Chunk>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, corpus_id, ordinal, content, metadata, embedding FROM chunks WHERE corpus_id = ?1 ORDER BY ordinal",
            )
            .map_err(db)?;
        let mut rows = stmt.query([corpus_id]).map_err(db)?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next().map_err(db)? {
            chunks.push(chunk_from_row(row)?);
        }
        Ok(chunks)
    }

    pub fn get_chunk(&self, chunk_id: i64) -> Result<Chunk> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, corpus_id, ordinal, content, metadata, embedding FROM chunks WHERE id = ?1",
            )
            .map_err(db)?;
        let mut rows = stmt.query([chunk_id]).map_err(db)?;
        match rows.next().map_err(db)? {
            Some(row) => chunk_from_row(row),
            None => Err(KbError::not_found("chunk", chunk_id)),
        }
    }

    /// Ids of the corpus chunks still missing an embedding, in ordinal order.
    pub fn pending_chunks(&self, corpus_id: i64) -> Result<Vec<i64>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM chunks WHERE corpus_id = ?1 AND embedding IS NULL ORDER BY ordinal",
            )
            .map_err(db)?;
        let ids = stmt
            .query_map([corpus_id], |row| row.get(0))
            .map_err(db)?
            .collect::<std::result::Result<Vec<i64>, _>>()
            .map_err(db)?;
        Ok(ids)
    }

    pub fn chunk_counts(&self, corpus_id: i64) -> Result<ChunkCounts> {
        let conn = self.connection()?;
        let (total, embedded): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(embedding) FROM chunks WHERE corpus_id = ?1",
                [corpus_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db)?;
        Ok(ChunkCounts {
            total: total as usize,
            embedded: embedded as usize,
        })
    }

    /// Embeds and stores one chunk. Returns `false` without calling the
    /// embedder when the stored vector was computed from the current content.
    pub fn generate_embedding(&self, chunk_id: i64, embedder: &dyn Embedder) -> Result<bool> {
        let conn = self.connection()?;
        let row: Option<(String, bool, Option<String>)> = conn
            .query_row(
                "SELECT content, embedding IS NOT NULL, content_hash FROM chunks WHERE id = ?1",
                [chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db)?;
        let Some((content, has_embedding, stored_hash)) = row else {
            return Err(KbError::not_found("chunk", chunk_id));
        };
        let hash = content_hash(&content);
        if has_embedding && stored_hash.as_deref() == Some(hash.as_str()) {
            debug!(chunk_id, "embedding is current");
            return Ok(false);
        }
        let vector = embedder.embed(&content)?;
        check_dimension(&vector, self.dimension)?;
        let changed = conn
            .execute(
                "UPDATE chunks SET embedding = ?1, content_hash = ?2 WHERE id = ?3",
                params![cast_slice::<f32, u8>(&vector), hash, chunk_id],
            )
            .map_err(db)?;
        if changed == 0 {
            return Err(KbError::not_found("chunk", chunk_id));
        }
        Ok(true)
    }

    /// Up to `k` embedded chunks of finalized corpora, closest first; ties
    /// fall back to corpus id then ordinal.
    pub fn similarity_search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        check_dimension(query, self.dimension)?;
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT
                    chunks.id,
                    chunks.corpus_id,
                    chunks.ordinal,
                    chunks.content,
                    corpora.tag,
                    corpora.group_name,
                    cosine_distance(chunks.embedding, ?1) AS distance
                FROM chunks
                JOIN corpora ON chunks.corpus_id = corpora.id
                WHERE chunks.embedding IS NOT NULL
                  AND corpora.finalized = 1
                  AND (?2 IS NULL OR corpora.tag = ?2)
                  AND (?3 IS NULL OR corpora.group_name = ?3)
                ORDER BY distance ASC, chunks.corpus_id ASC, chunks.ordinal ASC
                LIMIT ?4
                "#,
            )
            .map_err(db)?;
        let limit = i64::try_from(k).unwrap_or(i64::MAX);
        let mut rows = stmt
            .query(params![
                cast_slice::<f32, u8>(query),
                filters.tag,
                filters.group,
                limit
            ])
            .map_err(db)?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next().map_err(db)? {
            hits.push(ScoredChunk {
                chunk_id: row.get(0).map_err(db)?,
                corpus_id: row.get(1).map_err(db)?,
                ordinal: row.get(2).map_err(db)?,
                content: row.get(3).map_err(db)?,
                tag: row.get(4).map_err(db)?,
                group: row.get(5).map_err(db)?,
                distance: row.get::<_, f64>(6).map_err(db)? as f32,
            });
        }
        Ok(hits)
    }
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    pod_collect_to_vec::<u8, f32>(blob)
}

fn chunk_from_row(row: &Row<'_>) -> Result<Chunk> {
    let metadata: String = row.get(4).map_err(db)?;
    let metadata: Metadata = serde_json::from_str(&metadata)?;
    let embedding: Option<Vec<u8>> = row.get(5).map_err(db)?;
    Ok(Chunk {
        id: row.get(0).map_err(db)?,
        corpus_id: row.get(1).map_err(db)?,
        ordinal: row.get(2).map_err(db)?,
        content: row.get(3).map_err(db)?,
        metadata,
        embedding: embedding.map(|blob| decode_vector(&blob)),
    })
}
