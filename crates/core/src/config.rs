use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkConfig;
use crate::error::{KbError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderKind {
    RemoteHosted,
    SelfHosted,
    LocalModel,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProviderKind::RemoteHosted => "remote-hosted",
            EmbeddingProviderKind::SelfHosted => "self-hosted",
            EmbeddingProviderKind::LocalModel => "local-model",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimension: usize,
    pub base_url: Option<String>,
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::LocalModel,
            model: "hash-bow".to_string(),
            dimension: 1024,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Graph parameters for the approximate index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnnParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    /// Relational rows plus the file-backed ANN index used for retrieval.
    Embedded,
    /// Relational rows only; retrieval ranks inside the database.
    Relational,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub index_dir: PathBuf,
    pub deployment: Deployment,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("kbase.sqlite"),
            index_dir: PathBuf::from("kbase-index"),
            deployment: Deployment::Embedded,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkConfig,
    pub ann: AnnParams,
    pub storage: StorageConfig,
    pub workers: WorkerConfig,
}

impl EngineConfig {
    /// Reads a TOML config; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| KbError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(KbError::Config("embedding.dimension must be positive".into()));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(KbError::Config("embedding.model is required".into()));
        }
        if self.chunking.chunk_size == 0 {
            return Err(KbError::Config("chunking.chunk_size must be positive".into()));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(KbError::Config(
                "chunking.chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if self.ann.m < 2 || self.ann.ef_construction == 0 {
            return Err(KbError::Config(
                "ann.m must be at least 2 and ann.ef_construction positive".into(),
            ));
        }
        if self.embedding.provider == EmbeddingProviderKind::SelfHosted
            && self.embedding.base_url.is_none()
        {
            return Err(KbError::Config(
                "embedding.base_url is required for self-hosted providers".into(),
            ));
        }
        if self.workers.threads == 0 {
            return Err(KbError::Config("workers.threads must be positive".into()));
        }
        Ok(())
    }
}
