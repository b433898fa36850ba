//! Core data model: journal entries, processing stages, log records, events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timestamp type used for every record the pipeline produces.
pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A discrete phase of journal-entry processing.
///
/// Stages are totally ordered along the happy path
/// `created → analyzing → [fetching_urls] → generating_embeddings → completed`.
/// `failed` is absorbing and reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Entry persisted, no task has picked it up yet.
    Created,
    /// Content analysis in progress.
    Analyzing,
    /// Fetching the links found during analysis.
    FetchingUrls,
    /// Generating the embedding vector.
    GeneratingEmbeddings,
    /// All stages finished successfully.
    Completed,
    /// A stage failed; the entry carries the error text.
    Failed,
}

impl Stage {
    /// Every stage, in happy-path order followed by `failed`.
    pub const ALL: [Stage; 6] = [
        Self::Created,
        Self::Analyzing,
        Self::FetchingUrls,
        Self::GeneratingEmbeddings,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns the string representation stored in SQLite and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Analyzing => "analyzing",
            Self::FetchingUrls => "fetching_urls",
            Self::GeneratingEmbeddings => "generating_embeddings",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// Returns `None` if the value is not a recognised stage.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// `completed` and `failed` are terminal: no further transitions occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position on the happy path. `failed` has no position.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Analyzing => Some(1),
            Self::FetchingUrls => Some(2),
            Self::GeneratingEmbeddings => Some(3),
            Self::Completed => Some(4),
            Self::Failed => None,
        }
    }

    /// Whether the orchestrator may move an entry from `self` to `next`.
    ///
    /// Forward moves along the happy path are allowed (skipping
    /// `fetching_urls` included); `failed` is reachable from any
    /// non-terminal stage; nothing leaves a terminal stage.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown stage: {s}"))
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A link found during analysis, plus whatever fetching it produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedLink {
    /// Link target as written in the entry.
    pub url: String,
    /// Page title, empty when unknown or the fetch failed.
    #[serde(default)]
    pub title: String,
    /// Readable page text, empty when the fetch failed.
    #[serde(default)]
    pub fetched_content: String,
    /// Fetch failure reason; `None` when the fetch succeeded or never ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractedLink {
    /// A link that has not been fetched yet.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Whether fetching this link failed.
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// AI-derived enrichment attached to an entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessedData {
    /// Short summary of the entry.
    pub summary: String,
    /// People, places and things mentioned.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Topics the entry touches on.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Sentiment tag, e.g. `positive`.
    #[serde(default)]
    pub sentiment: String,
    /// Links in order of appearance.
    #[serde(default)]
    pub links: Vec<ExtractedLink>,
    /// Opaque analyzer metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Embedding vector; empty until `generating_embeddings` succeeds.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// A journal entry and its processing state.
///
/// Only the orchestrator task that owns the entry mutates `stage`,
/// `processed`, `error` and the stage timestamps after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Entry identity.
    pub id: Uuid,
    /// Raw text as written by the user.
    pub content: String,
    /// Current processing stage.
    pub stage: Stage,
    /// When the entry was created.
    pub created_at: Timestamp,
    /// When the entry entered its current stage.
    pub stage_entered_at: Timestamp,
    /// When the entry reached `completed`.
    pub completed_at: Option<Timestamp>,
    /// Stage-fatal error text, verbatim.
    pub error: Option<String>,
    /// Enrichment produced so far.
    pub processed: Option<ProcessedData>,
}

impl JournalEntry {
    /// Create a fresh entry in the `created` stage.
    pub fn new(content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            stage: Stage::Created,
            created_at: now,
            stage_entered_at: now,
            completed_at: None,
            error: None,
            processed: None,
        }
    }

    /// Put the entry back at `created` for another processing run.
    ///
    /// Clears the error and enrichment of the previous run.
    pub fn reset_for_retry(&mut self) {
        self.stage = Stage::Created;
        self.stage_entered_at = Utc::now();
        self.completed_at = None;
        self.error = None;
        self.processed = None;
    }
}

// ---------------------------------------------------------------------------
// Log records
// ---------------------------------------------------------------------------

/// Severity of a diagnostic log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose detail.
    Debug,
    /// Normal progress.
    Info,
    /// Recoverable problem.
    Warn,
    /// Stage-fatal problem.
    Error,
}

impl LogLevel {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable diagnostic record attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Entry the record belongs to.
    pub entry_id: Uuid,
    /// Stage the entry was in when the record was written.
    pub stage: Stage,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Structured detail payload.
    pub details: serde_json::Value,
    /// When the record was created.
    pub created_at: Timestamp,
}

impl LogRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        entry_id: Uuid,
        stage: Stage,
        level: LogLevel,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            entry_id,
            stage,
            level,
            message: message.into(),
            details,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Tag carried by every published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An entry moved to a non-terminal stage.
    StageChanged,
    /// An entry reached `completed`.
    Completed,
    /// An entry reached `failed`.
    Failed,
}

impl EventType {
    /// The event tag announcing a move into `stage`.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Completed => Self::Completed,
            Stage::Failed => Self::Failed,
            _ => Self::StageChanged,
        }
    }
}

/// An event published through the hub. Never mutated after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Entry the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<Uuid>,
    /// Event payload.
    pub payload: serde_json::Value,
    /// When the event was produced.
    pub timestamp: Timestamp,
}

impl Event {
    /// Event announcing that `entry_id` moved into `stage`.
    pub fn stage_transition(entry_id: Uuid, stage: Stage, error: Option<&str>) -> Self {
        let mut payload = serde_json::json!({ "stage": stage });
        if let (Some(err), Some(obj)) = (error, payload.as_object_mut()) {
            obj.insert("error".to_owned(), serde_json::json!(err));
        }
        Self {
            event_type: EventType::for_stage(stage),
            entry_id: Some(entry_id),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The stage carried in the payload of a transition event.
    pub fn stage(&self) -> Option<Stage> {
        self.payload
            .get("stage")
            .and_then(|v| v.as_str())
            .and_then(Stage::parse)
    }

    /// Whether this event announces a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Completed | EventType::Failed)
    }
}
