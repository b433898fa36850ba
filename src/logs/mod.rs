//! Log aggregator: in-memory buffer of diagnostic records with batched
//! flushes to the durable [`Store`].
//!
//! [`LogAggregator::append`] only pushes onto a mutex-guarded buffer and
//! never waits on the store. A background flusher writes the buffer as one
//! batch when either the record-count threshold is reached or the flush
//! interval has elapsed since the last flush.
//!
//! Failed flushes are reported through `tracing` and the batch is put back
//! in front of the buffer. While the store is failing the count trigger is
//! ignored: the batch is retried on the next interval tick or explicit
//! [`LogAggregator::flush`], not on every append. Retained and buffered
//! records together are capped at `max_retained_records`; beyond that the
//! oldest records are dropped.
//!
//! [`LogAggregator::query`] merges durable rows with records still in the
//! buffer. Queries and flushes serialize on one async lock, so a batch is
//! never seen twice or missed while it is in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{Store, StoreError};
use crate::types::{LogRecord, Stage};

/// Default record count that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 50;

/// Default time between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Default cap on retained plus buffered records.
pub const DEFAULT_MAX_RETAINED: usize = 5_000;

/// Aggregator tuning.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Buffered record count that triggers an immediate flush.
    pub flush_threshold: usize,
    /// Maximum time between flushes.
    pub flush_interval: Duration,
    /// Cap on records kept in memory while the store is failing.
    pub max_retained_records: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_retained_records: DEFAULT_MAX_RETAINED,
        }
    }
}

/// Counters describing aggregator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Successful non-empty flushes.
    pub flushes: u64,
    /// Records written to the store.
    pub records_flushed: u64,
    /// Flushes whose store write failed.
    pub failed_flushes: u64,
    /// Records discarded by the retention cap.
    pub records_dropped: u64,
    /// Records currently waiting in memory.
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    records_flushed: AtomicU64,
    failed_flushes: AtomicU64,
    records_dropped: AtomicU64,
}

/// Buffered, batch-flushing log sink shared by every orchestrator task.
pub struct LogAggregator {
    store: Arc<dyn Store>,
    config: AggregatorConfig,
    buffer: Mutex<Vec<LogRecord>>,
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
    /// Set by a failed flush, cleared by a successful one.
    store_failing: AtomicBool,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LogAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAggregator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl LogAggregator {
    /// Create an aggregator writing to `store`.
    ///
    /// Nothing is flushed automatically until [`LogAggregator::start`].
    pub fn new(store: Arc<dyn Store>, config: AggregatorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let flush_threshold = config.flush_threshold.max(1);
        Self {
            store,
            config: AggregatorConfig {
                flush_threshold,
                flush_interval: config.flush_interval,
                max_retained_records: config.max_retained_records.max(flush_threshold),
            },
            buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
            store_failing: AtomicBool::new(false),
            counters: Counters::default(),
            shutdown_tx,
            flusher: Mutex::new(None),
        }
    }

    /// Spawn the background flusher. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if flusher.is_some() {
            return;
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        *flusher = Some(tokio::spawn(run_flusher(Arc::clone(self), shutdown_rx)));
        info!(
            threshold = self.config.flush_threshold,
            interval_ms = u64::try_from(self.config.flush_interval.as_millis()).unwrap_or(u64::MAX),
            "log aggregator started"
        );
    }

    /// Stop the flusher and write whatever is still buffered.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        } else if let Err(e) = self.flush().await {
            error!(error = %e, "final log flush failed");
        }
        let stats = self.stats();
        info!(
            flushed = stats.records_flushed,
            unflushed = stats.buffered,
            "log aggregator stopped"
        );
    }

    /// Buffer one record. Never waits on the store.
    pub fn append(&self, record: LogRecord) {
        let len = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(record);
            buffer.len()
        };
        if len >= self.config.flush_threshold && !self.store_failing.load(Ordering::Acquire) {
            self.flush_requested.notify_one();
        }
    }

    /// Write the current buffer to the store as one batch.
    ///
    /// Returns the number of records written; an empty buffer is a no-op
    /// that does not touch the store.
    ///
    /// # Errors
    ///
    /// Returns the store error when the batch could not be written. The
    /// batch is retained for the next flush.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *buffer)
        };

        match self.store.insert_logs(&batch).await {
            Ok(()) => {
                if self.store_failing.swap(false, Ordering::AcqRel) {
                    info!("log store recovered");
                }
                let count = batch.len();
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .records_flushed
                    .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
                debug!(records = count, "log batch flushed");
                Ok(count)
            }
            Err(e) => {
                self.store_failing.store(true, Ordering::Release);
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    records = batch.len(),
                    "log flush failed, retaining batch for retry"
                );
                self.retain(batch);
                Err(e)
            }
        }
    }

    /// Put a failed batch back in front of the buffer, enforcing the cap.
    fn retain(&self, mut batch: Vec<LogRecord>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        batch.append(&mut buffer);
        let excess = batch.len().saturating_sub(self.config.max_retained_records);
        if excess > 0 {
            batch.drain(..excess);
            self.counters
                .records_dropped
                .fetch_add(u64::try_from(excess).unwrap_or(u64::MAX), Ordering::Relaxed);
            warn!(
                dropped = excess,
                cap = self.config.max_retained_records,
                "log retention cap reached, oldest records dropped"
            );
        }
        *buffer = batch;
    }

    /// Records for an entry in append order: durable rows first, then
    /// anything still buffered.
    ///
    /// # Errors
    ///
    /// Returns the store error if durable rows cannot be read.
    pub async fn query(
        &self,
        entry_id: Uuid,
        stage: Option<Stage>,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let _guard = self.flush_lock.lock().await;
        let mut records = self.store.query_logs(entry_id, stage).await?;
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        records.extend(
            buffer
                .iter()
                .filter(|r| r.entry_id == entry_id && stage.is_none_or(|s| r.stage == s))
                .cloned(),
        );
        Ok(records)
    }

    /// Current counters.
    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            records_flushed: self.counters.records_flushed.load(Ordering::Relaxed),
            failed_flushes: self.counters.failed_flushes.load(Ordering::Relaxed),
            records_dropped: self.counters.records_dropped.load(Ordering::Relaxed),
            buffered: self
                .buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// The aggregator's effective configuration.
    pub fn config(&self) -> AggregatorConfig {
        self.config
    }
}

/// Flush on threshold or interval until shutdown, then flush once more.
async fn run_flusher(aggregator: Arc<LogAggregator>, mut shutdown_rx: watch::Receiver<bool>) {
    let every = aggregator.config.flush_interval.max(Duration::from_millis(1));
    let start = tokio::time::Instant::now()
        .checked_add(every)
        .unwrap_or_else(tokio::time::Instant::now);
    let mut ticker = tokio::time::interval_at(start, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = aggregator.flush_requested.notified() => {
                // A request queued before the last failure waits for the tick.
                if aggregator.store_failing.load(Ordering::Acquire) {
                    continue;
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        // Failures are already reported and the batch retained.
        let _ = aggregator.flush().await;
        ticker.reset();
    }

    if let Err(e) = aggregator.flush().await {
        error!(error = %e, "final log flush failed");
    }
    debug!("log flusher stopped");
}
