//! Journal service: owns the shared components and schedules one
//! orchestrator task per entry.
//!
//! The service is the only place that spawns pipeline runs, so it also
//! enforces the single-writer rule: an entry with a live task cannot be
//! retried until that task has finished.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diagnosis::{DiagnosisError, FailureAnalyzer, RankedCause, DEFAULT_DIAGNOSIS_TIMEOUT};
use crate::hub::{EventHub, Observer};
use crate::logs::{FlushStats, LogAggregator};
use crate::pipeline::{Collaborators, Pipeline, PipelineConfig};
use crate::providers::DiagnosticModel;
use crate::store::{Store, StoreError};
use crate::types::{JournalEntry, LogLevel, LogRecord, Stage};

/// Default bound on waiting for in-flight tasks at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Service errors surfaced to callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No entry with this id exists.
    #[error("entry {0} not found")]
    NotFound(Uuid),
    /// The entry is being processed right now.
    #[error("entry {0} is still being processed")]
    InProgress(Uuid),
    /// The service no longer accepts work.
    #[error("service is shutting down")]
    ShuttingDown,
    /// Entry content was empty or whitespace.
    #[error("entry content is empty")]
    EmptyContent,
    /// The durable store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Failure analysis failed.
    #[error(transparent)]
    Diagnosis(#[from] DiagnosisError),
}

/// Timeouts governing the service and the components it builds.
#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Collaborator bounds for each pipeline run.
    pub pipeline: PipelineConfig,
    /// Bound on one diagnostic model call.
    pub diagnosis_timeout: Duration,
    /// Bound on waiting for in-flight tasks at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            diagnosis_timeout: DEFAULT_DIAGNOSIS_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Entry-level operations over the pipeline, hub, aggregator and analyzer.
pub struct JournalService {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    logs: Arc<LogAggregator>,
    pipeline: Arc<Pipeline>,
    analyzer: FailureAnalyzer,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for JournalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalService")
            .field("in_flight", &self.in_flight_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Releases an entry's in-flight claim when its task ends, however it ends.
struct InFlightClaim {
    id: Uuid,
    set: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl JournalService {
    /// Assemble the service from its shared components.
    ///
    /// Call [`JournalService::start`] before creating entries.
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<EventHub>,
        logs: Arc<LogAggregator>,
        collaborators: Collaborators,
        diagnostic_model: Arc<dyn DiagnosticModel>,
        config: ServiceConfig,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            collaborators,
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&logs),
            config.pipeline,
        ));
        let analyzer = FailureAnalyzer::new(
            Arc::clone(&logs),
            Arc::clone(&store),
            diagnostic_model,
            config.diagnosis_timeout,
        );
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            hub,
            logs,
            pipeline,
            analyzer,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Start the hub keepalive and the aggregator flusher.
    pub fn start(&self) {
        self.hub.start();
        self.logs.start();
        info!("journal service started");
    }

    /// Persist a new entry and schedule its processing. Returns at once.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::EmptyContent`] for blank content,
    /// [`ServiceError::ShuttingDown`] after shutdown began, or a store error.
    pub async fn create_entry(&self, content: &str) -> Result<JournalEntry, ServiceError> {
        self.ensure_accepting()?;
        if content.trim().is_empty() {
            return Err(ServiceError::EmptyContent);
        }

        let entry = JournalEntry::new(content);
        let claim = self.claim(entry.id)?;
        self.store.insert_entry(&entry).await?;
        self.logs.append(LogRecord::new(
            entry.id,
            Stage::Created,
            LogLevel::Info,
            "entry created",
            json!({ "chars": entry.content.chars().count() }),
        ));
        info!(entry_id = %entry.id, "entry created");

        self.spawn(entry.clone(), claim);
        Ok(entry)
    }

    /// Re-run processing for an entry from `created`.
    ///
    /// Earlier log records are kept; new ones append after them.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] for unknown ids,
    /// [`ServiceError::InProgress`] while the entry's task is live,
    /// [`ServiceError::ShuttingDown`] after shutdown began, or a store error.
    pub async fn retry(&self, id: Uuid) -> Result<JournalEntry, ServiceError> {
        self.ensure_accepting()?;
        let claim = self.claim(id)?;
        let mut entry = self
            .store
            .get_entry(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;

        let previous_stage = entry.stage;
        let previous_error = entry.error.clone();
        if !previous_stage.is_terminal() {
            warn!(entry_id = %id, stage = %previous_stage, "retrying entry abandoned mid-pipeline");
        }

        entry.reset_for_retry();
        self.store.update_entry(&entry).await?;
        self.logs.append(LogRecord::new(
            id,
            Stage::Created,
            LogLevel::Info,
            "retry requested",
            json!({ "previous_stage": previous_stage, "previous_error": previous_error }),
        ));
        info!(entry_id = %id, previous_stage = %previous_stage, "retry scheduled");

        self.spawn(entry.clone(), claim);
        Ok(entry)
    }

    /// Current state of one entry.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] or a store error.
    pub async fn get_entry(&self, id: Uuid) -> Result<JournalEntry, ServiceError> {
        self.store
            .get_entry(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Most recent entries first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list_entries(&self, limit: usize) -> Result<Vec<JournalEntry>, ServiceError> {
        Ok(self.store.list_entries(limit).await?)
    }

    /// Log records for an entry in append order, durable and buffered.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn query_logs(
        &self,
        id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<LogRecord>, ServiceError> {
        Ok(self.logs.query(id, stage).await?)
    }

    /// Ranked causes for an entry's failure.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Diagnosis`] wrapping the analyzer's error.
    pub async fn analyze_failure(&self, id: Uuid) -> Result<Vec<RankedCause>, ServiceError> {
        Ok(self.analyzer.analyze(id).await?)
    }

    /// Register a live event observer.
    pub fn subscribe(&self) -> Observer {
        self.hub.subscribe()
    }

    /// Aggregator counters.
    pub fn log_stats(&self) -> FlushStats {
        self.logs.stats()
    }

    /// Number of entries with a live orchestrator task.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait until every task scheduled so far has finished.
    pub async fn wait_idle(&self) {
        let mut tasks = self.take_tasks();
        while tasks.join_next().await.is_some() {}
    }

    /// Stop accepting work, cancel in-flight collaborator calls, wait up to
    /// the shutdown timeout for tasks, then stop the hub and flush logs.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let mut tasks = self.take_tasks();
        info!(in_flight = tasks.len(), "journal service shutting down");

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "tasks still running at shutdown deadline, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.hub.stop().await;
        self.logs.shutdown().await;
        info!("journal service stopped");
    }

    fn ensure_accepting(&self) -> Result<(), ServiceError> {
        if self.is_shutting_down() {
            return Err(ServiceError::ShuttingDown);
        }
        Ok(())
    }

    fn claim(&self, id: Uuid) -> Result<InFlightClaim, ServiceError> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id) {
            return Err(ServiceError::InProgress(id));
        }
        Ok(InFlightClaim {
            id,
            set: Arc::clone(&self.in_flight),
        })
    }

    fn spawn(&self, entry: JournalEntry, claim: InFlightClaim) {
        let pipeline = Arc::clone(&self.pipeline);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let _claim = claim;
            let entry = pipeline.process(entry, shutdown_rx).await;
            debug!(entry_id = %entry.id, stage = %entry.stage, "orchestrator task finished");
        });
    }

    fn take_tasks(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
