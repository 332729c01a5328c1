//! Processing outcomes and per-run statistics

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::ProcessingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Terminal status of one source within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Phases ran (or the cache answered) and produced a payload
    Completed,
    /// Definition disabled; nothing ran
    Skipped,
    /// Attempt failed; `error` carries the attribution
    Error,
}

/// Immutable outcome of processing one source.
///
/// Created once per source per run by the orchestrator and memoized for the
/// rest of the run; later requesters share the same value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub source_name: String,

    pub status: ProcessStatus,

    /// Structured payload; `Null` for skipped and failed sources
    pub payload: Value,

    /// Sum of lengths of top-level array-valued payload fields
    pub record_count: usize,

    /// When the payload was computed. Cache hits keep the entry's stored
    /// timestamp so dependent cache keys stay stable across runs.
    pub processed_at: DateTime<Utc>,

    /// Wall-clock duration of this run's attempt
    pub processing_time_ms: u64,

    /// True when the payload came from the cache store
    pub from_cache: bool,

    /// Failure attribution for `status == Error`
    pub error: Option<ProcessingError>,
}

impl ProcessingResult {
    /// Successful outcome; derives the record count from the payload
    pub fn completed(
        source_name: impl Into<String>,
        payload: Value,
        processed_at: DateTime<Utc>,
        processing_time_ms: u64,
        from_cache: bool,
    ) -> Self {
        let record_count = count_records(&payload);
        Self {
            source_name: source_name.into(),
            status: ProcessStatus::Completed,
            payload,
            record_count,
            processed_at,
            processing_time_ms,
            from_cache,
            error: None,
        }
    }

    /// Outcome for a disabled definition
    pub fn skipped(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            status: ProcessStatus::Skipped,
            payload: Value::Null,
            record_count: 0,
            processed_at: Utc::now(),
            processing_time_ms: 0,
            from_cache: false,
            error: None,
        }
    }

    /// Outcome for a failed attempt
    pub fn failed(
        source_name: impl Into<String>,
        error: ProcessingError,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            status: ProcessStatus::Error,
            payload: Value::Null,
            record_count: 0,
            processed_at: Utc::now(),
            processing_time_ms,
            from_cache: false,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ProcessStatus::Completed
    }
}

/// Sum of lengths of top-level array-valued fields.
///
/// Non-object payloads have no countable fields and report zero.
pub fn count_records(payload: &Value) -> usize {
    match payload.as_object() {
        Some(map) => map
            .values()
            .filter_map(Value::as_array)
            .map(|records| records.len())
            .sum(),
        None => 0,
    }
}

/// Aggregated outcome of one batch run.
///
/// Fresh per run, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    /// Unique run identifier
    pub run_id: Uuid,

    /// Sources that reached a terminal state this run
    pub sources_processed: usize,

    pub sources_succeeded: usize,

    pub sources_failed: usize,

    pub sources_skipped: usize,

    /// Records across all completed sources
    pub total_records: usize,

    /// Diagnostics collected across the run, in emission order
    pub diagnostics: Vec<Diagnostic>,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatistics {
    /// Create new empty statistics for a starting run
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            sources_processed: 0,
            sources_succeeded: 0,
            sources_failed: 0,
            sources_skipped: 0,
            total_records: 0,
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Fold one terminal result into the counters
    pub fn record(&mut self, result: &ProcessingResult) {
        self.sources_processed += 1;
        match result.status {
            ProcessStatus::Completed => {
                self.sources_succeeded += 1;
                self.total_records += result.record_count;
            }
            ProcessStatus::Skipped => self.sources_skipped += 1,
            ProcessStatus::Error => self.sources_failed += 1,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Wall-clock duration, available once finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    /// Count diagnostics by severity
    pub fn count_by_kind(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}
