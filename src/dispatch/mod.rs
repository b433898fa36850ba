//! Dispatch surface: named operations mapped onto [`JournalService`].
//!
//! The set of operations is the closed [`Operation`] enum. The name table
//! is built and checked once in [`Dispatcher::new`]; dispatching matches
//! exhaustively on the enum, so every operation has exactly one handler.

use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_stream::Stream;
use tracing::debug;
use uuid::Uuid;

use crate::hub::frame::sse_frames;
use crate::service::{JournalService, ServiceError};
use crate::types::Stage;

/// Default `limit` for `list_entries`.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Every operation the surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create an entry and schedule processing.
    CreateEntry,
    /// Re-run processing from `created`.
    RetryProcessing,
    /// Read one entry.
    GetEntry,
    /// Read recent entries.
    ListEntries,
    /// Read an entry's log records.
    QueryLogs,
    /// Diagnose an entry's failure.
    AnalyzeFailure,
    /// Open a live event stream.
    Subscribe,
}

impl Operation {
    /// All operations.
    pub const ALL: [Operation; 7] = [
        Self::CreateEntry,
        Self::RetryProcessing,
        Self::GetEntry,
        Self::ListEntries,
        Self::QueryLogs,
        Self::AnalyzeFailure,
        Self::Subscribe,
    ];

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateEntry => "create_entry",
            Self::RetryProcessing => "retry_processing",
            Self::GetEntry => "get_entry",
            Self::ListEntries => "list_entries",
            Self::QueryLogs => "query_logs",
            Self::AnalyzeFailure => "analyze_failure",
            Self::Subscribe => "subscribe",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| DispatchError::UnknownOperation(s.to_owned()))
    }
}

/// Live SSE frames for a `subscribe` call.
pub type FrameStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Result of a dispatched operation.
pub enum DispatchResponse {
    /// A single JSON document.
    Json(Value),
    /// A live stream of `data:` and keepalive frames.
    Stream(FrameStream),
}

impl std::fmt::Debug for DispatchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl DispatchResponse {
    /// The JSON document, if this is not a stream.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Stream(_) => None,
        }
    }
}

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No operation has this name.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// The operation's parameters did not decode.
    #[error("invalid params for {operation}: {reason}")]
    InvalidParams {
        /// Operation name.
        operation: &'static str,
        /// Decoder message.
        reason: String,
    },
    /// Two operations share a name.
    #[error("operation table is invalid: {0}")]
    InvalidTable(String),
    /// The service rejected the call.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The result could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateParams {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EntryParams {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogParams {
    id: Uuid,
    #[serde(default)]
    stage: Option<Stage>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}

/// Routes operation names to the service.
pub struct Dispatcher {
    service: Arc<JournalService>,
    table: HashMap<&'static str, Operation>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("operations", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build and check the operation table.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidTable`] if two operations share a
    /// name or a name does not resolve back to its operation.
    pub fn new(service: Arc<JournalService>) -> Result<Self, DispatchError> {
        let mut table = HashMap::with_capacity(Operation::ALL.len());
        for op in Operation::ALL {
            if table.insert(op.name(), op).is_some() {
                return Err(DispatchError::InvalidTable(format!(
                    "duplicate name {}",
                    op.name()
                )));
            }
            if Operation::from_str(op.name()).ok() != Some(op) {
                return Err(DispatchError::InvalidTable(format!(
                    "{} does not resolve to itself",
                    op.name()
                )));
            }
        }
        Ok(Self { service, table })
    }

    /// Operation names in declaration order.
    pub fn operations(&self) -> Vec<&'static str> {
        Operation::ALL.iter().map(Operation::name).collect()
    }

    /// Run the operation called `name` with JSON `params`.
    ///
    /// `null` params are treated as `{}`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownOperation`], [`DispatchError::InvalidParams`],
    /// or the service's error.
    pub async fn dispatch(&self, name: &str, params: Value) -> Result<DispatchResponse, DispatchError> {
        let op = *self
            .table
            .get(name)
            .ok_or_else(|| DispatchError::UnknownOperation(name.to_owned()))?;
        debug!(operation = %op, "dispatching");

        let response = match op {
            Operation::CreateEntry => {
                let p: CreateParams = decode(op, params)?;
                let entry = self.service.create_entry(&p.content).await?;
                DispatchResponse::Json(serde_json::to_value(entry)?)
            }
            Operation::RetryProcessing => {
                let p: EntryParams = decode(op, params)?;
                let entry = self.service.retry(p.id).await?;
                DispatchResponse::Json(serde_json::to_value(entry)?)
            }
            Operation::GetEntry => {
                let p: EntryParams = decode(op, params)?;
                let entry = self.service.get_entry(p.id).await?;
                DispatchResponse::Json(serde_json::to_value(entry)?)
            }
            Operation::ListEntries => {
                let p: ListParams = decode(op, params)?;
                let entries = self.service.list_entries(p.limit).await?;
                DispatchResponse::Json(serde_json::to_value(entries)?)
            }
            Operation::QueryLogs => {
                let p: LogParams = decode(op, params)?;
                let records = self.service.query_logs(p.id, p.stage).await?;
                DispatchResponse::Json(serde_json::to_value(records)?)
            }
            Operation::AnalyzeFailure => {
                let p: EntryParams = decode(op, params)?;
                let causes = self.service.analyze_failure(p.id).await?;
                DispatchResponse::Json(json!({ "entry_id": p.id, "causes": causes }))
            }
            Operation::Subscribe => {
                let _: NoParams = decode(op, params)?;
                let observer = self.service.subscribe();
                DispatchResponse::Stream(Box::pin(sse_frames(observer)))
            }
        };
        Ok(response)
    }
}

fn decode<T: DeserializeOwned>(op: Operation, params: Value) -> Result<T, DispatchError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| DispatchError::InvalidParams {
        operation: op.name(),
        reason: e.to_string(),
    })
}
