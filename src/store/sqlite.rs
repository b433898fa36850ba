//! SQLite-backed [`Store`] using `sqlx`.
//!
//! The schema is applied inline via `include_str!` on open. Timestamps are
//! stored as RFC 3339 text and JSON columns as serialized text.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Store, StoreError};
use crate::types::{JournalEntry, LogLevel, LogRecord, ProcessedData, Stage, Timestamp};

/// Schema applied on every open; statements are idempotent.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Connections for file-backed databases.
const MAX_CONNECTIONS: u32 = 4;

type EntryRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

type LogRow = (String, String, String, String, String, String);

/// SQLite persistence for entries and logs.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the
    /// database cannot be opened, or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "journal database opened");
        Self::with_pool(pool).await
    }

    /// Open a private in-memory database.
    ///
    /// Uses one pinned connection so the database lives as long as the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let processed = encode_processed(entry.processed.as_ref())?;
        sqlx::query(
            "INSERT INTO entries \
             (id, content, stage, created_at, stage_entered_at, completed_at, error, processed) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.content)
        .bind(entry.stage.as_str())
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.stage_entered_at.to_rfc3339())
        .bind(entry.completed_at.map(|t| t.to_rfc3339()))
        .bind(&entry.error)
        .bind(processed)
        .execute(&self.pool)
        .await?;
        debug!(entry_id = %entry.id, "entry inserted");
        Ok(())
    }

    async fn update_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let processed = encode_processed(entry.processed.as_ref())?;
        sqlx::query(
            "UPDATE entries SET stage = ?1, stage_entered_at = ?2, completed_at = ?3, \
             error = ?4, processed = ?5 WHERE id = ?6",
        )
        .bind(entry.stage.as_str())
        .bind(entry.stage_entered_at.to_rfc3339())
        .bind(entry.completed_at.map(|t| t.to_rfc3339()))
        .bind(&entry.error)
        .bind(processed)
        .bind(entry.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<JournalEntry>, StoreError> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT id, content, stage, created_at, stage_entered_at, completed_at, error, processed \
             FROM entries WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_entry).transpose()
    }

    async fn list_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, StoreError> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT id, content, stage, created_at, stage_entered_at, completed_at, error, processed \
             FROM entries ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_entry).collect()
    }

    async fn insert_logs(&self, batch: &[LogRecord]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in batch {
            let details = serde_json::to_string(&record.details)?;
            sqlx::query(
                "INSERT INTO logs (entry_id, stage, level, message, details, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(record.entry_id.to_string())
            .bind(record.stage.as_str())
            .bind(record.level.as_str())
            .bind(&record.message)
            .bind(details)
            .bind(record.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(records = batch.len(), "log batch committed");
        Ok(())
    }

    async fn query_logs(
        &self,
        entry_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let rows: Vec<LogRow> = match stage {
            Some(stage) => {
                sqlx::query_as(
                    "SELECT entry_id, stage, level, message, details, created_at \
                     FROM logs WHERE entry_id = ?1 AND stage = ?2 ORDER BY seq ASC",
                )
                .bind(entry_id.to_string())
                .bind(stage.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT entry_id, stage, level, message, details, created_at \
                     FROM logs WHERE entry_id = ?1 ORDER BY seq ASC",
                )
                .bind(entry_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(decode_log).collect()
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn encode_processed(processed: Option<&ProcessedData>) -> Result<Option<String>, StoreError> {
    processed
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn decode_entry(row: EntryRow) -> Result<JournalEntry, StoreError> {
    let (id, content, stage, created_at, stage_entered_at, completed_at, error, processed) = row;
    Ok(JournalEntry {
        id: parse_uuid(&id)?,
        content,
        stage: parse_stage(&stage)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        stage_entered_at: parse_timestamp("stage_entered_at", &stage_entered_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|t| parse_timestamp("completed_at", t))
            .transpose()?,
        error,
        processed: processed
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
    })
}

fn decode_log(row: LogRow) -> Result<LogRecord, StoreError> {
    let (entry_id, stage, level, message, details, created_at) = row;
    Ok(LogRecord {
        entry_id: parse_uuid(&entry_id)?,
        stage: parse_stage(&stage)?,
        level: LogLevel::parse(&level).ok_or_else(|| StoreError::InvalidValue {
            field: "level",
            value: level.clone(),
        })?,
        message,
        details: serde_json::from_str(&details)?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|_| StoreError::InvalidValue {
        field: "id",
        value: value.to_owned(),
    })
}

fn parse_stage(value: &str) -> Result<Stage, StoreError> {
    Stage::parse(value).ok_or_else(|| StoreError::InvalidValue {
        field: "stage",
        value: value.to_owned(),
    })
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<Timestamp, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field,
            value: value.to_owned(),
        })
}
