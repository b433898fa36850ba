//! Stage orchestrator: drives one journal entry through
//! `analyzing → [fetching_urls] → generating_embeddings → completed`.
//!
//! Each transition updates the entry, persists it, appends exactly one log
//! record at the new stage and publishes exactly one event. Link fetching is
//! best-effort per link; analysis and embedding failures are terminal.
//!
//! Collaborator calls are bounded by per-stage timeouts and raced against a
//! shutdown signal. A cancelled run leaves the entry at whatever stage it
//! last persisted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::hub::EventHub;
use crate::logs::LogAggregator;
use crate::providers::{Analyzer, Embedder, Fetcher, ProviderError};
use crate::store::Store;
use crate::types::{Event, ExtractedLink, JournalEntry, LogLevel, LogRecord, ProcessedData, Stage};

/// Default bound on one analysis call.
pub const DEFAULT_ANALYZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on one link fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on one embedding call.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// The external services one processing run invokes.
#[derive(Clone)]
pub struct Collaborators {
    /// Content analysis.
    pub analyzer: Arc<dyn Analyzer>,
    /// Per-link retrieval.
    pub fetcher: Arc<dyn Fetcher>,
    /// Embedding generation.
    pub embedder: Arc<dyn Embedder>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("embedding_dims", &self.embedder.dimensions())
            .finish_non_exhaustive()
    }
}

/// Per-stage call bounds.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Bound on the analyzer call.
    pub analyze_timeout: Duration,
    /// Bound on each fetcher call.
    pub fetch_timeout: Duration,
    /// Bound on the embedder call.
    pub embed_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analyze_timeout: DEFAULT_ANALYZE_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }
}

/// Why a collaborator call produced no value.
#[derive(Debug)]
enum CallError {
    Failed(ProviderError),
    TimedOut(Duration),
    Cancelled,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            Self::Cancelled => f.write_str("cancelled by shutdown"),
        }
    }
}

/// Drives entries through their stages.
///
/// One `Pipeline` is shared by every orchestrator task; it holds no
/// per-entry state.
pub struct Pipeline {
    collaborators: Collaborators,
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    logs: Arc<LogAggregator>,
    config: PipelineConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wire a pipeline to its collaborators and shared components.
    pub fn new(
        collaborators: Collaborators,
        store: Arc<dyn Store>,
        hub: Arc<EventHub>,
        logs: Arc<LogAggregator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            collaborators,
            store,
            hub,
            logs,
            config,
        }
    }

    /// Run `entry` from `created` to a terminal stage.
    ///
    /// Returns the entry as last written. It is terminal unless `shutdown`
    /// fired while a collaborator call was outstanding, in which case it
    /// stays at its last persisted stage.
    #[instrument(skip_all, fields(entry_id = %entry.id))]
    pub async fn process(
        &self,
        mut entry: JournalEntry,
        mut shutdown: watch::Receiver<bool>,
    ) -> JournalEntry {
        if entry.stage != Stage::Created {
            warn!(stage = %entry.stage, "entry is not at created, refusing to process");
            return entry;
        }
        info!("processing started");

        self.advance(&mut entry, Stage::Analyzing, json!({})).await;
        let analysis = self.collaborators.analyzer.analyze(&entry.content);
        let mut processed = match call(analysis, self.config.analyze_timeout, &mut shutdown).await {
            Ok(data) => data,
            Err(CallError::Cancelled) => return abandon(entry),
            Err(e) => {
                self.fail(&mut entry, format!("analysis error: {e}")).await;
                return entry;
            }
        };
        processed.links = processed
            .links
            .into_iter()
            .map(|link| ExtractedLink::new(link.url))
            .collect();
        processed.embedding.clear();
        let link_count = processed.links.len();
        entry.processed = Some(processed);

        if link_count > 0 {
            self.advance(&mut entry, Stage::FetchingUrls, json!({ "links": link_count }))
                .await;
            if self.fetch_links(&mut entry, &mut shutdown).await.is_err() {
                return abandon(entry);
            }
        }

        let failed_links = entry
            .processed
            .as_ref()
            .map_or(0, |p| p.links.iter().filter(|l| l.is_failed()).count());
        self.advance(
            &mut entry,
            Stage::GeneratingEmbeddings,
            json!({ "links": link_count, "failed_links": failed_links }),
        )
        .await;

        let text = compose_embedding_text(&entry.content, entry.processed.as_ref());
        let embedding = self.collaborators.embedder.embed(&text);
        match call(embedding, self.config.embed_timeout, &mut shutdown).await {
            Ok(vector) => {
                let dims = vector.len();
                if let Some(processed) = entry.processed.as_mut() {
                    processed.embedding = vector;
                }
                self.advance(&mut entry, Stage::Completed, json!({ "dimensions": dims }))
                    .await;
                info!("processing completed");
            }
            Err(CallError::Cancelled) => return abandon(entry),
            Err(e) => {
                self.fail(&mut entry, format!("embedding error: {e}")).await;
            }
        }
        entry
    }

    /// Fetch every link in order. Individual failures are recorded on the
    /// link and as one `warn` record; only cancellation aborts the stage.
    async fn fetch_links(
        &self,
        entry: &mut JournalEntry,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CallError> {
        let entry_id = entry.id;
        let Some(processed) = entry.processed.as_mut() else {
            return Ok(());
        };
        for link in &mut processed.links {
            let fetch = self.collaborators.fetcher.fetch(&link.url);
            match call(fetch, self.config.fetch_timeout, shutdown).await {
                Ok(page) => {
                    debug!(url = %link.url, chars = page.content.len(), "link fetched");
                    link.title = page.title;
                    link.fetched_content = page.content;
                }
                Err(CallError::Cancelled) => return Err(CallError::Cancelled),
                Err(e) => {
                    let reason = e.to_string();
                    warn!(url = %link.url, error = %reason, "link fetch failed");
                    self.logs.append(LogRecord::new(
                        entry_id,
                        Stage::FetchingUrls,
                        LogLevel::Warn,
                        "link fetch failed",
                        json!({ "url": link.url, "error": reason }),
                    ));
                    link.title.clear();
                    link.fetched_content.clear();
                    link.error = Some(reason);
                }
            }
        }
        Ok(())
    }

    /// Mark the entry failed with `message` as its error text.
    async fn fail(&self, entry: &mut JournalEntry, message: String) {
        error!(stage = %entry.stage, error = %message, "processing failed");
        let details = json!({ "from": entry.stage, "error": message });
        entry.error = Some(message);
        self.advance(entry, Stage::Failed, details).await;
    }

    /// Move to `next`: persist, record, announce.
    async fn advance(&self, entry: &mut JournalEntry, next: Stage, details: Value) {
        if !entry.stage.can_advance_to(next) {
            error!(from = %entry.stage, to = %next, "illegal stage transition ignored");
            return;
        }
        let now = Utc::now();
        entry.stage = next;
        entry.stage_entered_at = now;
        if next == Stage::Completed {
            entry.completed_at = Some(now);
        }

        if let Err(e) = self.store.update_entry(entry).await {
            error!(stage = %next, error = %e, "failed to persist stage transition");
        }

        let level = if next == Stage::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.logs.append(LogRecord::new(
            entry.id,
            next,
            level,
            transition_message(next),
            details,
        ));

        let report = self
            .hub
            .publish(Event::stage_transition(entry.id, next, entry.error.as_deref()));
        debug!(
            stage = %next,
            delivered = report.delivered,
            dropped = report.dropped,
            "stage transition published"
        );
    }
}

fn transition_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Created => "entry created",
        Stage::Analyzing => "analysis started",
        Stage::FetchingUrls => "fetching links",
        Stage::GeneratingEmbeddings => "generating embeddings",
        Stage::Completed => "processing completed",
        Stage::Failed => "processing failed",
    }
}

fn abandon(entry: JournalEntry) -> JournalEntry {
    warn!(stage = %entry.stage, "processing abandoned on shutdown");
    entry
}

/// Await `fut` bounded by `limit`, giving up early if shutdown fires.
async fn call<T, F>(
    fut: F,
    limit: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<T, CallError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    if *shutdown.borrow() {
        return Err(CallError::Cancelled);
    }
    tokio::select! {
        biased;
        () = shutdown_signalled(shutdown) => Err(CallError::Cancelled),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Failed(e)),
            Err(_) => Err(CallError::TimedOut(limit)),
        },
    }
}

/// Resolves once shutdown is requested; never resolves if the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Text handed to the embedder: the raw content followed by the summary,
/// then each fetched link's title and content.
pub fn compose_embedding_text(content: &str, processed: Option<&ProcessedData>) -> String {
    let mut parts: Vec<&str> = vec![content.trim()];
    if let Some(processed) = processed {
        parts.push(processed.summary.trim());
        for link in &processed.links {
            parts.push(link.title.trim());
            parts.push(link.fetched_content.trim());
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join("\n\n")
}
