//! Embeddings over HTTP.
//!
//! Ollama answers `POST /api/embeddings` with `{"embedding": [...]}`; OpenAI
//! compatible servers answer `POST /v1/embeddings` with
//! `{"data": [{"embedding": [...]}]}`. [`HttpEmbedder::cached`] builds the
//! embedder a twin normally runs with: wrapped in a
//! [`CachedEmbedder`] sized by `retrieval.query_cache_size`.

use doppel_core::CachedEmbedder;
use doppel_core::config::{LlmConfig, TwinConfig};
use doppel_core::embedding::{self, EmbeddingProvider};
use doppel_core::error::EmbeddingError;
use doppel_core::types::Embedding;
use serde_json::{Value, json};

use crate::client::{LlmClient, LlmProvider};
use crate::error::LlmError;

/// Embedding provider backed by [`LlmClient`].
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: LlmClient,
    dimensions: usize,
}

impl HttpEmbedder {
    /// Wrap a client whose model is an embedding model producing
    /// `dimensions` floats.
    #[must_use]
    pub fn new(client: LlmClient, dimensions: usize) -> Self {
        Self { client, dimensions }
    }

    /// Embedder for `llm.embedding_model`.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::from_config`].
    pub fn from_config(config: &LlmConfig, dimensions: usize) -> Result<Self, LlmError> {
        let client = LlmClient::from_config(config)?.with_model(config.embedding_model.clone());
        Ok(Self::new(client, dimensions))
    }

    /// Embedder for a whole twin configuration: `llm.embedding_model`
    /// producing `memory.embedding_dimensions` floats, behind an LRU of
    /// `retrieval.query_cache_size` entries.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::from_config`].
    pub fn cached(config: &TwinConfig) -> Result<CachedEmbedder<Self>, LlmError> {
        let embedder = Self::from_config(&config.llm, config.memory.embedding_dimensions)?;
        Ok(CachedEmbedder::from_config(embedder, &config.retrieval))
    }

    /// Fetch the raw vector without checking its length.
    ///
    /// # Errors
    ///
    /// Transport failures as for [`LlmClient::generate`];
    /// [`LlmError::SchemaValidation`] when the body holds no numeric vector.
    pub async fn fetch(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let model = self.client.model();
        let json = match self.client.provider() {
            LlmProvider::None => {
                return Err(LlmError::Unavailable("no embedding provider configured".into()));
            }
            LlmProvider::Ollama { .. } => {
                let body = json!({ "model": model, "prompt": text });
                let json = self.client.post_json("/api/embeddings", &body).await?;
                json["embedding"].clone()
            }
            LlmProvider::OpenAiCompatible { .. } => {
                let body = json!({ "model": model, "input": text });
                let json = self.client.post_json("/v1/embeddings", &body).await?;
                json["data"][0]["embedding"].clone()
            }
        };
        parse_vector(&json)
    }
}

impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let vector = Embedding(self.fetch(text).await?);
        embedding::validate(&vector, self.dimensions)?;
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        self.client.model()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn parse_vector(value: &Value) -> Result<Vec<f32>, LlmError> {
    let items = value
        .as_array()
        .ok_or_else(|| LlmError::SchemaValidation("embedding is not an array".into()))?;
    items
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| LlmError::SchemaValidation("embedding holds a non-numeric entry".into()))
}
