//! HTTP link fetcher with title and readable-text extraction.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use super::{check_http_response, FetchedPage, Fetcher, ProviderError};

/// Default cap on readable text kept per page.
pub const DEFAULT_MAX_CHARS: usize = 20_000;

static TITLE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok());

static NON_CONTENT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>").ok());

static TAG_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").ok());

/// Fetches pages over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_chars: usize,
}

impl HttpFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jotter/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    /// Cap the readable text kept per page.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ProviderError> {
        let parsed = validate_url(url)?;
        let response = self.client.get(parsed).send().await?;
        let body = check_http_response(response).await?;
        Ok(extract_page(&body, self.max_chars))
    }
}

/// Accept only absolute `http`/`https` URLs.
///
/// # Errors
///
/// Returns `ProviderError::InvalidInput` for anything else.
pub fn validate_url(raw: &str) -> Result<Url, ProviderError> {
    let url = Url::parse(raw).map_err(|e| ProviderError::InvalidInput(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProviderError::InvalidInput(format!(
            "unsupported scheme {other:?} in {raw}"
        ))),
    }
}

/// Pull the title and readable text out of an HTML (or plain text) body.
pub fn extract_page(body: &str, max_chars: usize) -> FetchedPage {
    let title = TITLE_PATTERN
        .as_ref()
        .and_then(|re| re.captures(body))
        .and_then(|caps| caps.get(1))
        .map(|m| collapse_whitespace(m.as_str()))
        .unwrap_or_default();

    let mut text = body.to_owned();
    if let Some(re) = NON_CONTENT_PATTERN.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = TAG_PATTERN.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    let content: String = collapse_whitespace(&text).chars().take(max_chars).collect();

    FetchedPage { title, content }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
