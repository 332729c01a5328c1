//! Incremental, dependency-aware processing engine for climbing data.
//!
//! Named sources (JSON exports, scraped HTML grade tables, GPX waypoint
//! files) are fetched, parsed, and validated through one shared lifecycle,
//! with payloads cached on disk and recomputed only when inputs or
//! dependencies change. The orchestrator resolves dependency graphs
//! depth-first, memoizes per-run results, detects cycles, and isolates
//! per-source failures in batch runs.

pub mod cache;
pub mod orchestrator;
pub mod registry;
pub mod source;
pub mod sources;

pub use cache::{CacheError, CacheStore, FsCacheStore};
pub use orchestrator::Orchestrator;
pub use registry::{SourceFactory, SourceRegistry};
pub use source::{ParseOutput, Source, SourceContext, SourceOutcome, ValidateOutput};
