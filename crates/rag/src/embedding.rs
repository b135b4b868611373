use std::env;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use kbase_core::{
    check_dimension, ensure_embeddable, Embedder, EmbeddingConfig, EmbeddingProviderKind,
    HashEmbedder, HashEmbedderConfig, KbError, Result,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
    Ollama(OllamaEmbeddingClient),
}

/// The configured embedding backend. Every batch is checked for blank input
/// before the backend is called, and every returned vector for count and
/// dimension.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    model: String,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend = match config.provider {
            EmbeddingProviderKind::RemoteHosted => {
                let api_key = env::var(&config.api_key_env).map_err(|_| {
                    KbError::Config(format!(
                        "{} is required for remote-hosted embeddings",
                        config.api_key_env
                    ))
                })?;
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| OPENAI_BASE_URL.to_string());
                EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(
                    &base_url,
                    &config.model,
                    api_key,
                )?)
            }
            EmbeddingProviderKind::SelfHosted => {
                let base_url = config.base_url.as_deref().ok_or_else(|| {
                    KbError::Config("self-hosted embeddings need embedding.base_url".to_string())
                })?;
                EmbeddingBackend::Ollama(OllamaEmbeddingClient::new(base_url, &config.model)?)
            }
            EmbeddingProviderKind::LocalModel => {
                EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                    dimensions: config.dimension,
                    ..HashEmbedderConfig::default()
                }))
            }
        };
        debug!(
            provider = config.provider.as_str(),
            model = %config.model,
            dimension = config.dimension,
            "configured embedding backend"
        );
        Ok(Self {
            backend,
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }

    pub fn hash(dimension: usize) -> Self {
        let embedder = HashEmbedder::new(HashEmbedderConfig {
            dimensions: dimension,
            ..HashEmbedderConfig::default()
        });
        Self {
            model: embedder.model().to_string(),
            backend: EmbeddingBackend::Hash(embedder),
            dimension,
        }
    }

    pub fn backend(&self) -> &EmbeddingBackend {
        &self.backend
    }
}

impl Embedder for EmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        ensure_embeddable(texts)?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = match &self.backend {
            EmbeddingBackend::Hash(embedder) => {
                texts
                    .iter()
                    .map(|text| embedder.embed_text(text))
                    .collect::<Result<Vec<_>>>()?
            }
            EmbeddingBackend::OpenAi(client) => client.embed_batch(texts)?,
            EmbeddingBackend::Ollama(client) => client.embed_batch(texts)?,
        };
        if vectors.len() != texts.len() {
            return Err(KbError::embedding(format!(
                "backend returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        for vector in &vectors {
            check_dimension(vector, self.dimension)?;
        }
        Ok(vectors)
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|err| KbError::embedding(format!("failed to build http client: {err}")))
}

/// OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(base_url: &str, model: &str, api_key: String) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| KbError::embedding(format!("embeddings request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(KbError::embedding(format!(
                "embeddings request failed: {}",
                response.status()
            )));
        }
        let mut parsed: OpenAiEmbeddingResponse = response
            .json()
            .map_err(|err| KbError::embedding(format!("malformed embeddings response: {err}")))?;
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Ollama-compatible `/api/embed` endpoint.
#[derive(Clone)]
pub struct OllamaEmbeddingClient {
    http: Client,
    url: String,
    model: String,
}

impl OllamaEmbeddingClient {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|err| KbError::embedding(format!("embed request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(KbError::embedding(format!(
                "embed request failed: {}",
                response.status()
            )));
        }
        let parsed: OllamaEmbedResponse = response
            .json()
            .map_err(|err| KbError::embedding(format!("malformed embed response: {err}")))?;
        Ok(parsed.embeddings)
    }
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}
