//! Diagnostics surfaced during source processing
//!
//! Record-level findings (a dropped record, a suspicious field) are reported
//! as [`Diagnostic`] values rather than errors so a single bad record never
//! aborts its source. Structural failures stay on the error path.

use crate::error::{ErrorCategory, ProcessingError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    /// A record was rejected or an attempt failed
    Error,
    /// Suspicious but non-fatal condition
    Warning,
}

/// One finding emitted while processing a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity
    pub kind: DiagnosticKind,

    /// Failure category from the shared taxonomy
    pub category: ErrorCategory,

    /// Source the finding is attributed to
    pub source_name: String,

    /// Human-readable description
    pub message: String,

    /// Optional structured context (offending record, field name, ...)
    pub context: Option<serde_json::Value>,

    /// When the finding was produced
    pub occurred_at: DateTime<Utc>,
}

impl Diagnostic {
    /// Create new error diagnostic
    pub fn error(
        category: ErrorCategory,
        source_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            category,
            source_name: source_name.into(),
            message: message.into(),
            context: None,
            occurred_at: Utc::now(),
        }
    }

    /// Create new warning diagnostic
    pub fn warning(
        category: ErrorCategory,
        source_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            category,
            source_name: source_name.into(),
            message: message.into(),
            context: None,
            occurred_at: Utc::now(),
        }
    }

    /// Attach structured context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Promote a processing failure into a diagnostic
    pub fn from_error(err: &ProcessingError) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            category: err.category,
            source_name: err.source_name.clone(),
            message: err.message.clone(),
            context: err.context.clone(),
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for diagnostics as they are produced
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

/// Default sink: forwards diagnostics to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::Error => tracing::error!(
                source = %diagnostic.source_name,
                category = %diagnostic.category,
                context = ?diagnostic.context,
                "{}",
                diagnostic.message
            ),
            DiagnosticKind::Warning => tracing::warn!(
                source = %diagnostic.source_name,
                category = %diagnostic.category,
                context = ?diagnostic.context,
                "{}",
                diagnostic.message
            ),
        }
    }
}

/// In-memory sink for tests and run summaries
#[derive(Debug, Default)]
pub struct MemorySink {
    collected: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.collected.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.lock().unwrap().is_empty()
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.collected.lock().unwrap().push(diagnostic.clone());
    }
}
