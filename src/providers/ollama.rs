//! Minimal Ollama `/api/chat` client shared by the analyzer and the
//! diagnostic model.

use serde::{Deserialize, Serialize};

use super::{check_http_response, ProviderError};

/// Default Ollama API base URL.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Ollama chat API request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct OllamaRequest {
    /// Model name.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<OllamaMessage>,
    /// Disable streaming for non-streaming calls.
    pub stream: bool,
    /// Constrain output to JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A message in Ollama format.
#[doc(hidden)]
#[derive(Debug, Serialize, Deserialize)]
pub struct OllamaMessage {
    /// Role: "system", "user" or "assistant".
    pub role: String,
    /// Message content.
    pub content: String,
}

/// Ollama chat API response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct OllamaResponse {
    /// Response message.
    pub message: OllamaMessage,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Chat client for one Ollama model.
#[derive(Debug, Clone)]
pub struct OllamaChat {
    /// Model name passed to Ollama.
    #[doc(hidden)]
    pub model: String,
    /// Base URL for the Ollama API.
    #[doc(hidden)]
    pub base_url: String,
    client: reqwest::Client,
}

impl OllamaChat {
    /// Create a chat client for `model` at `base_url`.
    pub fn new(model: &str, base_url: &str) -> Self {
        Self {
            model: model.to_owned(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Send one system + user exchange in JSON mode and return the
    /// assistant's raw text.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport, status or parse failure.
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let request = build_request(&self.model, system, user);
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }
}

/// Build a JSON-mode chat request.
#[doc(hidden)]
pub fn build_request(model: &str, system: &str, user: &str) -> OllamaRequest {
    OllamaRequest {
        model: model.to_owned(),
        messages: vec![
            OllamaMessage {
                role: "system".to_owned(),
                content: system.to_owned(),
            },
            OllamaMessage {
                role: "user".to_owned(),
                content: user.to_owned(),
            },
        ],
        stream: false,
        format: Some("json".to_owned()),
    }
}

/// Pull the assistant text out of a chat response body.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if the body cannot be deserialized or the
/// message is empty.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<String, ProviderError> {
    let resp: OllamaResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if resp.message.content.trim().is_empty() {
        return Err(ProviderError::Parse("empty response message".to_owned()));
    }
    Ok(resp.message.content)
}
