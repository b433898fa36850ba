//! Durable storage for journal entries and batched log records.
//!
//! The [`Store`] trait is the seam between the pipeline and persistence.
//! [`SqliteStore`] is the production implementation.

pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{JournalEntry, LogRecord, Stage};

pub use self::sqlite::SqliteStore;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An invalid value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidValue {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// The store cannot be reached right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable CRUD for entries plus batched log inserts.
///
/// Implementations must be `Send + Sync`; one store is shared by every
/// orchestrator task and the log aggregator.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new entry.
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), StoreError>;

    /// Overwrite the processing fields of an existing entry in one statement.
    async fn update_entry(&self, entry: &JournalEntry) -> Result<(), StoreError>;

    /// Fetch one entry.
    async fn get_entry(&self, id: Uuid) -> Result<Option<JournalEntry>, StoreError>;

    /// Most recently created entries first.
    async fn list_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError>;

    /// Write a batch of log records as one unit: all or nothing.
    async fn insert_logs(&self, batch: &[LogRecord]) -> Result<(), StoreError>;

    /// Durable log records for an entry in append order, optionally
    /// restricted to one stage.
    async fn query_logs(
        &self,
        entry_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<LogRecord>, StoreError>;
}
