//! Ollama implementation of [`Embedder`].
//!
//! Calls the Ollama `/api/embed` endpoint for local embedding generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ollama::DEFAULT_OLLAMA_URL;
use super::{check_http_response, Embedder, ProviderError};

/// Ollama-based embedder using the `/api/embed` endpoint.
///
/// Calls `POST {base_url}/api/embed` with the model name and input text,
/// returning the embedding vector.
pub struct OllamaEmbedder {
    model: String,
    client: reqwest::Client,
    base_url: String,
    dims: usize,
}

impl std::fmt::Debug for OllamaEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEmbedder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dims", &self.dims)
            .finish()
    }
}

impl OllamaEmbedder {
    /// Create an Ollama embedder for the given model.
    ///
    /// `dims` is the expected dimensionality of embeddings (e.g. 768 for
    /// nomic-embed-text). Vectors of any other length are rejected.
    pub fn new(model: &str, dims: usize) -> Self {
        Self::with_base_url(model, DEFAULT_OLLAMA_URL, dims)
    }

    /// Create an Ollama embedder with a custom base URL.
    pub fn with_base_url(model: &str, base_url: &str, dims: usize) -> Self {
        Self {
            model: model.to_owned(),
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            dims,
        }
    }

    fn build_request(&self, text: &str) -> OllamaEmbedRequest {
        OllamaEmbedRequest {
            model: self.model.clone(),
            input: text.to_owned(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embed", self.base_url);
        let body = self.build_request(text);

        let response = self.client.post(&url).json(&body).send().await?;
        let payload = check_http_response(response).await?;

        let parsed: OllamaEmbedResponse =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let embedding = parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("empty embeddings array".to_owned()))?;

        if embedding.len() != self.dims {
            return Err(ProviderError::Parse(format!(
                "expected {} dimensions, got {}",
                self.dims,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Request body for Ollama `/api/embed`.
#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    /// Model name.
    model: String,
    /// Input text to embed.
    input: String,
}

/// Response body from Ollama `/api/embed`.
#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    /// Array of embedding vectors (one per input).
    embeddings: Vec<Vec<f32>>,
}
