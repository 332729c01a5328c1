//! Common error types for the cragdata engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Common result type for source-attributed operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Closed set of failure categories
///
/// `TransformError` and `ImportError` belong to downstream collaborators
/// (transform pipelines, final-store importers); the engine never raises
/// them but carries them so collaborator diagnostics share one taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Definition-set defect: duplicate name, unknown source or kind, cycle
    ConfigError,
    /// Raw input could not be acquired
    SourceError,
    /// Input structure could not be interpreted
    ParseError,
    /// Content failed validation rules
    ValidationError,
    /// Reserved for transform collaborators
    TransformError,
    /// Reserved for final-store importers
    ImportError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConfigError => "config-error",
            ErrorCategory::SourceError => "source-error",
            ErrorCategory::ParseError => "parse-error",
            ErrorCategory::ValidationError => "validation-error",
            ErrorCategory::TransformError => "transform-error",
            ErrorCategory::ImportError => "import-error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing failure attributed to one source
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{category} in source '{source_name}': {message}")]
pub struct ProcessingError {
    /// Human-readable description
    pub message: String,

    /// Machine-readable failure category
    pub category: ErrorCategory,

    /// Source the failure is attributed to
    pub source_name: String,

    /// Optional structured context (offending record, file path, cycle path)
    pub context: Option<serde_json::Value>,
}

impl ProcessingError {
    pub fn new(
        category: ErrorCategory,
        source_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            category,
            source_name: source_name.into(),
            context: None,
        }
    }

    /// Create new config error
    pub fn config(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ConfigError, source_name, message)
    }

    /// Create new source error
    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::SourceError, source_name, message)
    }

    /// Create new parse error
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ParseError, source_name, message)
    }

    /// Create new validation error
    pub fn validation(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ValidationError, source_name, message)
    }

    /// Attach structured context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Wrap an arbitrary error report with category and source attribution.
    ///
    /// Idempotent: a report that already carries a `ProcessingError` is
    /// returned unchanged, so wrappers never nest and the innermost
    /// (most specific) attribution wins.
    pub fn wrap(err: anyhow::Error, category: ErrorCategory, source_name: &str) -> anyhow::Error {
        if err.downcast_ref::<ProcessingError>().is_some() {
            return err;
        }
        let attributed = Self::new(category, source_name, format!("{err:#}"));
        err.context(attributed)
    }

    /// Extract the attributed error from a report, synthesizing a
    /// source-error when the report never went through `wrap`.
    pub fn from_anyhow(err: &anyhow::Error, source_name: &str) -> Self {
        match err.downcast_ref::<ProcessingError>() {
            Some(attributed) => attributed.clone(),
            None => Self::new(ErrorCategory::SourceError, source_name, format!("{err:#}")),
        }
    }
}

/// Configuration loading error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error reading the configuration file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Definition-set defect detected at load time
    #[error(transparent)]
    Definition(#[from] ProcessingError),

    /// No configuration file could be resolved
    #[error("No configuration file found")]
    NotFound,
}
