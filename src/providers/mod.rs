//! External collaborators invoked by the pipeline and the failure analyzer.
//!
//! Defines the [`Analyzer`], [`Fetcher`], [`Embedder`] and
//! [`DiagnosticModel`] traits plus the shared error type. The pipeline only
//! sees these traits; the concrete implementations are:
//! - [`analyzer::OllamaAnalyzer`]: content analysis via Ollama `/api/chat`
//! - [`fetcher::HttpFetcher`]: plain HTTP GET with title/text extraction
//! - [`embedder::OllamaEmbedder`]: Ollama `/api/embed`
//! - [`diagnostic::OllamaDiagnosticModel`]: failure diagnosis via Ollama

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ProcessedData;

pub mod analyzer;
pub mod diagnostic;
pub mod embedder;
pub mod fetcher;
pub mod ollama;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Content analysis: summary, entities, topics, sentiment and links.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Analyze raw entry content.
    ///
    /// Links in the returned data are unfetched: only `url` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport, status or parse failure.
    async fn analyze(&self, content: &str) -> Result<ProcessedData, ProviderError>;
}

/// A fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedPage {
    /// Page title, empty when the page has none.
    pub title: String,
    /// Readable page text.
    pub content: String,
}

/// Link retrieval, invoked once per extracted link.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one URL.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the URL is invalid or unreachable.
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ProviderError>;
}

/// Embedding generation.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding provider is unreachable or the
    /// request fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Returns the dimensionality of the embedding vectors produced.
    fn dimensions(&self) -> usize;
}

/// A candidate root cause returned by a [`DiagnosticModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCause {
    /// What most likely went wrong.
    pub cause: String,
    /// What to do about it.
    pub solution: String,
    /// Model-assigned likelihood in `[0, 1]`.
    pub probability: f64,
}

/// Root-cause diagnosis over a failed entry's logs.
#[async_trait]
pub trait DiagnosticModel: Send + Sync {
    /// Produce candidate causes for the failure described by `context`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the model is unreachable or its answer
    /// cannot be parsed.
    async fn diagnose(&self, context: &str) -> Result<Vec<CandidateCause>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match expected schema.
    #[error("response parse error: {0}")]
    Parse(String),
    /// Upstream responded with an error status.
    #[error("non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// The collaborator cannot serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The input was rejected before any request was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

// ---------------------------------------------------------------------------
// HTTP helpers (shared by all collaborators)
// ---------------------------------------------------------------------------

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure, `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [r"sk-[A-Za-z0-9_\-]{20,}", r"Bearer\s+[A-Za-z0-9._\-]{16,}"] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

/// Extract the outermost `{...}` object from model output that may carry
/// extra prose around it.
pub fn extract_json_object(text: &str) -> &str {
    let trimmed = text.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}
