use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("embedding error: {reason}")]
    Embedding { reason: String },
    #[error("index io error at {path:?}: {reason}")]
    IndexIo { path: PathBuf, reason: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    /// Stable tag surfaced to callers of the engine.
    pub fn kind(&self) -> &'static str {
        match self {
            KbError::Embedding { .. } => "embedding",
            KbError::IndexIo { .. } => "index_io",
            KbError::Validation(_) => "validation",
            KbError::NotFound { .. } => "not_found",
            KbError::Storage(_) => "storage",
            KbError::Config(_) => "config",
        }
    }

    pub fn embedding(reason: impl Into<String>) -> Self {
        KbError::Embedding {
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        KbError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        KbError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn index_io(path: &Path, reason: impl ToString) -> Self {
        KbError::IndexIo {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for KbError {
    fn from(value: serde_json::Error) -> Self {
        Self::Storage(format!("json: {value}"))
    }
}

impl From<toml::de::Error> for KbError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
