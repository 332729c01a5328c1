//! # Cragdata Common Library
//!
//! Shared code for the cragdata engine crates including:
//! - Error taxonomy and source-attributed processing errors
//! - Diagnostics and diagnostic sinks
//! - Processing results and run statistics
//! - Source definitions
//! - Configuration loading

pub mod config;
pub mod definition;
pub mod diagnostics;
pub mod error;
pub mod result;

pub use config::EngineConfig;
pub use definition::SourceDefinition;
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, MemorySink, TracingSink};
pub use error::{ConfigError, ErrorCategory, ProcessingError, Result};
pub use result::{ProcessStatus, ProcessingResult, RunStatistics};
