//! Failure analyzer: ranked root causes for an entry, derived from its
//! diagnostic log records by an external [`DiagnosticModel`].
//!
//! The model's candidates are sorted by probability and cut at the first
//! candidate that pushes the cumulative probability past
//! [`CUMULATIVE_THRESHOLD`].

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::logs::LogAggregator;
use crate::providers::{CandidateCause, DiagnosticModel};
use crate::store::{Store, StoreError};
use crate::types::{JournalEntry, LogRecord};

/// Cumulative probability the returned prefix must exceed.
pub const CUMULATIVE_THRESHOLD: f64 = 0.8;

/// Default bound on one diagnostic model call.
pub const DEFAULT_DIAGNOSIS_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of log records included in the context.
const MAX_LOG_RECORDS: usize = 50;

/// Maximum character length of the context sent to the model.
const MAX_CONTEXT_CHARS: usize = 8000;

/// One ranked cause returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCause {
    /// What most likely went wrong.
    pub cause: String,
    /// What to do about it.
    pub solution: String,
    /// Model-assigned likelihood.
    pub probability: f64,
}

impl From<CandidateCause> for RankedCause {
    fn from(c: CandidateCause) -> Self {
        Self {
            cause: c.cause,
            solution: c.solution,
            probability: c.probability,
        }
    }
}

/// Failure analysis errors. Distinct from pipeline failures.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    /// The entry has no log records to diagnose from.
    #[error("no logs available for entry {0}")]
    NoLogsAvailable(Uuid),
    /// The diagnostic model is unreachable or its answer was unusable.
    #[error("diagnosis unavailable: {0}")]
    DiagnosisUnavailable(String),
    /// Log records could not be read.
    #[error("failed to read logs: {0}")]
    Logs(#[from] StoreError),
}

/// Produces ranked causes for failed entries.
pub struct FailureAnalyzer {
    logs: Arc<LogAggregator>,
    store: Arc<dyn Store>,
    model: Arc<dyn DiagnosticModel>,
    timeout: Duration,
}

impl std::fmt::Debug for FailureAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureAnalyzer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FailureAnalyzer {
    /// Create an analyzer reading logs from `logs` and entry state from `store`.
    pub fn new(
        logs: Arc<LogAggregator>,
        store: Arc<dyn Store>,
        model: Arc<dyn DiagnosticModel>,
        timeout: Duration,
    ) -> Self {
        Self {
            logs,
            store,
            model,
            timeout,
        }
    }

    /// Ranked causes for `entry_id`'s failure.
    ///
    /// # Errors
    ///
    /// - [`DiagnosisError::NoLogsAvailable`] if the entry has no records.
    /// - [`DiagnosisError::DiagnosisUnavailable`] if the model fails, times
    ///   out, or returns no usable candidates.
    /// - [`DiagnosisError::Logs`] if the log store cannot be read.
    pub async fn analyze(&self, entry_id: Uuid) -> Result<Vec<RankedCause>, DiagnosisError> {
        let records = self.logs.query(entry_id, None).await?;
        if records.is_empty() {
            return Err(DiagnosisError::NoLogsAvailable(entry_id));
        }

        // Entry state only enriches the context.
        let entry = match self.store.get_entry(entry_id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "entry unavailable for diagnosis context");
                None
            }
        };

        let context = build_context(entry.as_ref(), &records);
        debug!(entry_id = %entry_id, records = records.len(), chars = context.len(), "diagnosis context built");

        let candidates = match tokio::time::timeout(self.timeout, self.model.diagnose(&context)).await {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => return Err(DiagnosisError::DiagnosisUnavailable(e.to_string())),
            Err(_) => {
                return Err(DiagnosisError::DiagnosisUnavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        let causes = select_causes(candidates);
        if causes.is_empty() {
            return Err(DiagnosisError::DiagnosisUnavailable(
                "model returned no usable causes".to_owned(),
            ));
        }
        info!(entry_id = %entry_id, causes = causes.len(), "failure diagnosed");
        Ok(causes)
    }
}

/// Rank candidates and keep the shortest prefix whose cumulative
/// probability exceeds [`CUMULATIVE_THRESHOLD`].
///
/// Candidates with a negative or non-finite probability are discarded.
/// Equal probabilities keep their original order. If the threshold is
/// never exceeded every remaining candidate is returned.
pub fn select_causes(candidates: Vec<CandidateCause>) -> Vec<RankedCause> {
    let mut ranked: Vec<RankedCause> = candidates
        .into_iter()
        .filter(|c| c.probability.is_finite() && c.probability >= 0.0)
        .map(RankedCause::from)
        .collect();
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));

    let mut cumulative = 0.0_f64;
    let mut keep = ranked.len();
    for (i, cause) in ranked.iter().enumerate() {
        cumulative += cause.probability;
        if cumulative > CUMULATIVE_THRESHOLD {
            keep = i.saturating_add(1);
            break;
        }
    }
    ranked.truncate(keep);
    ranked
}

/// Render the entry summary and its most recent records as model input.
pub fn build_context(entry: Option<&JournalEntry>, records: &[LogRecord]) -> String {
    let mut context = String::with_capacity(MAX_CONTEXT_CHARS);

    if let Some(entry) = entry {
        let _ = writeln!(context, "## Entry\nstage: {}", entry.stage);
        if let Some(error) = &entry.error {
            let _ = writeln!(context, "error: {error}");
        }
        context.push('\n');
    }

    context.push_str("## Processing logs\n");
    let shown = if records.len() > MAX_LOG_RECORDS {
        let skipped = records.len().saturating_sub(MAX_LOG_RECORDS);
        let _ = writeln!(context, "({skipped} earlier records omitted)");
        &records[skipped..]
    } else {
        records
    };

    for record in shown {
        let _ = write!(
            context,
            "[{}] {} {}: {}",
            record.created_at.format("%H:%M:%S%.3f"),
            record.level,
            record.stage,
            record.message
        );
        if record.details.as_object().is_some_and(|o| !o.is_empty()) {
            let _ = write!(context, " {}", record.details);
        }
        context.push('\n');
        if context.len() > MAX_CONTEXT_CHARS {
            break;
        }
    }

    if context.len() > MAX_CONTEXT_CHARS {
        let mut cut = MAX_CONTEXT_CHARS;
        while !context.is_char_boundary(cut) {
            cut = cut.saturating_sub(1);
        }
        context.truncate(cut);
        context.push_str("\n...[truncated]");
    }
    context
}
