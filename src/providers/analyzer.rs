//! Content analysis via an Ollama chat model.
//!
//! The model is asked for a JSON object with summary, entities, topics,
//! sentiment and links. URLs written literally in the entry are merged with
//! the links the model reports, so a model that misses a URL still yields it.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::ollama::OllamaChat;
use super::{extract_json_object, Analyzer, ProviderError};
use crate::types::{ExtractedLink, ProcessedData};

/// Default cap on links carried forward from one entry.
pub const DEFAULT_MAX_LINKS: usize = 10;

static URL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).ok());

const ANALYSIS_SYSTEM_PROMPT: &str = "\
You analyze personal journal entries.

Respond with a JSON object:
{
  \"summary\": \"one or two sentences\",
  \"entities\": [\"people, places, organisations\"],
  \"topics\": [\"short topic labels\"],
  \"sentiment\": \"positive\" | \"neutral\" | \"negative\" | \"mixed\",
  \"links\": [\"every URL mentioned in the entry\"]
}

Output ONLY the JSON object, no other text.";

/// Analyzer backed by an Ollama chat model.
#[derive(Debug, Clone)]
pub struct OllamaAnalyzer {
    chat: OllamaChat,
    max_links: usize,
}

impl OllamaAnalyzer {
    /// Create an analyzer for `model` at `base_url`.
    pub fn new(model: &str, base_url: &str) -> Self {
        Self {
            chat: OllamaChat::new(model, base_url),
            max_links: DEFAULT_MAX_LINKS,
        }
    }

    /// Cap the number of links carried forward from one entry.
    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links;
        self
    }
}

#[async_trait]
impl Analyzer for OllamaAnalyzer {
    async fn analyze(&self, content: &str) -> Result<ProcessedData, ProviderError> {
        let raw = self.chat.complete_json(ANALYSIS_SYSTEM_PROMPT, content).await?;
        let data = parse_analysis(&raw, content, self.max_links)?;
        debug!(
            links = data.links.len(),
            topics = data.topics.len(),
            "analysis parsed"
        );
        Ok(data)
    }
}

/// Analysis object as the model returns it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisResponse {
    summary: String,
    entities: Vec<String>,
    topics: Vec<String>,
    sentiment: String,
    links: Vec<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

/// Turn model output into [`ProcessedData`], merging in URLs found in the
/// raw content.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if no JSON object can be decoded.
pub fn parse_analysis(
    raw: &str,
    content: &str,
    max_links: usize,
) -> Result<ProcessedData, ProviderError> {
    let parsed: AnalysisResponse = serde_json::from_str(extract_json_object(raw))
        .map_err(|e| ProviderError::Parse(format!("analysis response: {e}")))?;

    let mut urls = extract_urls(content);
    urls.extend(parsed.links.iter().map(|u| u.trim().to_owned()));
    let links = dedupe(urls)
        .into_iter()
        .filter(|u| !u.is_empty())
        .take(max_links)
        .map(ExtractedLink::new)
        .collect();

    Ok(ProcessedData {
        summary: parsed.summary,
        entities: parsed.entities,
        topics: parsed.topics,
        sentiment: parsed.sentiment,
        links,
        metadata: parsed.extra,
        embedding: Vec::new(),
    })
}

/// URLs written literally in `content`, in order of appearance.
pub fn extract_urls(content: &str) -> Vec<String> {
    let Some(pattern) = URL_PATTERN.as_ref() else {
        return Vec::new();
    };
    pattern
        .find_iter(content)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?'])
                .to_owned()
        })
        .collect()
}

fn dedupe(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .filter(|u| seen.insert(u.clone()))
        .collect()
}
