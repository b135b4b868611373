use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{KbError, Result};

/// Produces fixed-dimension vectors from text.
///
/// Implementations must reject blank input with [`KbError::Validation`]
/// before contacting any backend; a blank embedding corrupts ranking.
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut output = self.embed_many(&[text.to_string()])?;
        output
            .pop()
            .ok_or_else(|| KbError::embedding("backend returned no vector"))
    }
}

pub fn ensure_embeddable(texts: &[String]) -> Result<()> {
    if let Some(idx) = texts.iter().position(|text| text.trim().is_empty()) {
        return Err(KbError::validation(format!(
            "refusing to embed blank text at position {idx}"
        )));
    }
    Ok(())
}

pub fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(KbError::validation(format!(
            "embedding dimension mismatch: expected {expected}, got {}",
            vector.len()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 64,
            seed: 1337,
        }
    }
}

/// Offline bag-of-words embedder: each lowercase token lands in a hashed
/// bucket, the result is L2-normalized.
#[derive(Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
    model: String,
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self {
            config,
            model: format!("hash-bow-{}", config.dimensions.max(1)),
        }
    }

    /// Fails on text without a single alphanumeric token; its vector would
    /// be all zeros.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let dims = self.config.dimensions.max(1);
        let mut vector = vec![0f32; dims];
        let mut tokens = 0usize;
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            let bucket = self.bucket_for(token);
            vector[bucket] += 1.0;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(KbError::validation("text has no embeddable tokens"));
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn bucket_for(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.config.seed);
        token.to_lowercase().hash(&mut hasher);
        (hasher.finish() as usize) % self.config.dimensions.max(1)
    }
}

impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.config.dimensions.max(1)
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        ensure_embeddable(texts)?;
        texts.iter().map(|text| self.embed_text(text)).collect()
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
