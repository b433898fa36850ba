//! Failure diagnosis via an Ollama chat model.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::ollama::OllamaChat;
use super::{extract_json_object, CandidateCause, DiagnosticModel, ProviderError};

const DIAGNOSIS_SYSTEM_PROMPT: &str = "\
You are a diagnostician for a journal enrichment pipeline. The pipeline runs
content analysis, link fetching and embedding generation against external AI
services. Read the entry's processing logs and identify likely root causes.

Respond with a JSON object:
{
  \"causes\": [
    {\"cause\": \"one sentence\", \"solution\": \"what to do\", \"probability\": 0.0-1.0}
  ]
}

Output ONLY the JSON object, no other text.";

/// Diagnostic model backed by an Ollama chat model.
#[derive(Debug, Clone)]
pub struct OllamaDiagnosticModel {
    chat: OllamaChat,
}

impl OllamaDiagnosticModel {
    /// Create a diagnostic model for `model` at `base_url`.
    pub fn new(model: &str, base_url: &str) -> Self {
        Self {
            chat: OllamaChat::new(model, base_url),
        }
    }
}

#[async_trait]
impl DiagnosticModel for OllamaDiagnosticModel {
    async fn diagnose(&self, context: &str) -> Result<Vec<CandidateCause>, ProviderError> {
        debug!(model = %self.chat.model, "failure diagnosis starting");
        let raw = self.chat.complete_json(DIAGNOSIS_SYSTEM_PROMPT, context).await?;
        parse_causes(&raw)
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosisResponse {
    causes: Vec<CandidateCause>,
}

/// Parse the model's JSON answer into candidate causes.
///
/// Accepts either `{"causes": [...]}` or a bare array.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if neither shape decodes.
pub fn parse_causes(text: &str) -> Result<Vec<CandidateCause>, ProviderError> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<CandidateCause>>(trimmed)
            .map_err(|e| ProviderError::Parse(format!("diagnosis response: {e}")));
    }

    match serde_json::from_str::<DiagnosisResponse>(extract_json_object(trimmed)) {
        Ok(resp) => Ok(resp.causes),
        Err(e) => {
            warn!(
                error = %e,
                text_preview = %trimmed.chars().take(200).collect::<String>(),
                "failed to parse diagnosis JSON"
            );
            Err(ProviderError::Parse(format!("diagnosis response: {e}")))
        }
    }
}
