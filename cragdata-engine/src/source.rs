//! Source contract: the fetch/parse/validate lifecycle every data source
//! implements, plus the shared processing template that ties the phases to
//! the cache store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cragdata_common::{
    Diagnostic, DiagnosticKind, ErrorCategory, ProcessingError, ProcessingResult,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheStore};

/// Construction-time input for a concrete source instance
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    /// Definition name this instance runs under; used for attribution
    pub name: String,

    /// Opaque settings from the definition
    pub config: serde_json::Map<String, Value>,

    /// Terminal results of direct dependencies, keyed by definition name
    pub dependencies: BTreeMap<String, Arc<ProcessingResult>>,
}

impl SourceContext {
    pub fn new(
        name: impl Into<String>,
        config: serde_json::Map<String, Value>,
        dependencies: BTreeMap<String, Arc<ProcessingResult>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            dependencies,
        }
    }

    /// Deserialize the opaque config map into a typed source config
    pub fn typed_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProcessingError> {
        serde_json::from_value(Value::Object(self.config.clone())).map_err(|err| {
            ProcessingError::config(&self.name, format!("invalid source config: {err}"))
        })
    }

    /// Payload of a completed dependency. `None` when the dependency is
    /// unknown, was skipped, or failed.
    pub fn dependency_payload(&self, name: &str) -> Option<&Value> {
        self.dependencies
            .get(name)
            .filter(|result| result.succeeded())
            .map(|result| &result.payload)
    }
}

/// Parse phase output
#[derive(Debug, Clone)]
pub struct ParseOutput {
    /// Structured payload; by convention an object with record arrays and a
    /// `metadata` object
    pub payload: Value,

    /// Record-level findings from parsing
    pub diagnostics: Vec<Diagnostic>,
}

/// Validate phase output
#[derive(Debug, Clone)]
pub struct ValidateOutput {
    /// Payload with failing records dropped
    pub payload: Value,

    /// One error diagnostic per dropped record, warnings for suspicious ones
    pub diagnostics: Vec<Diagnostic>,

    /// Records examined before any were dropped
    pub total_validated: usize,
}

/// Outcome of one processing pass
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    /// Validated payload
    pub payload: Value,

    /// Findings from this attempt; empty on a cache hit
    pub diagnostics: Vec<Diagnostic>,

    /// When the payload was computed. Cache hits report the entry's stored
    /// time, not the hit time.
    pub computed_at: DateTime<Utc>,

    /// True when the payload came from the cache store
    pub from_cache: bool,
}

/// First 12 hex characters of the SHA-256 digest
pub fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let hex = format!("{digest:x}");
    hex[..12].to_string()
}

/// Base cache key: implementation type name plus a digest of the source
/// configuration. `serde_json::Map` keeps keys sorted, so equal configs
/// serialize identically.
pub fn base_cache_key(type_name: &str, config: &serde_json::Map<String, Value>) -> String {
    let serialized = Value::Object(config.clone()).to_string();
    format!("{}_{}", type_name, short_hash(serialized.as_bytes()))
}

/// Effective cache key: the base key extended with a digest of dependency
/// processing timestamps, so dependents recompute whenever a dependency
/// produced a newer result.
pub fn effective_cache_key(
    base: &str,
    dependencies: &BTreeMap<String, Arc<ProcessingResult>>,
) -> String {
    if dependencies.is_empty() {
        return base.to_string();
    }

    let mut joined = String::new();
    for (name, result) in dependencies {
        joined.push_str(name);
        joined.push('=');
        joined.push_str(&result.processed_at.timestamp_millis().to_string());
        joined.push(';');
    }
    format!("{}_deps_{}", base, short_hash(joined.as_bytes()))
}

fn cache_read_err(err: CacheError, source_name: &str) -> anyhow::Error {
    ProcessingError::wrap(
        anyhow::Error::new(err),
        ErrorCategory::SourceError,
        source_name,
    )
}

/// Contract every concrete source implements.
///
/// `fetch`, `parse`, and `validate` are the per-source phases; [`process`]
/// is the shared template tying them to the cache store and is not meant to
/// be overridden. Phase errors may be plain reports; the template attributes
/// them to the right category, and an already-attributed error passes
/// through unchanged.
///
/// [`process`]: Source::process
#[async_trait]
pub trait Source: Send + Sync {
    /// Implementation identifier; first component of the cache key
    fn type_name(&self) -> &'static str;

    /// Definition context this instance was built with
    fn context(&self) -> &SourceContext;

    /// Whether processed payloads may be cached
    fn cache_enabled(&self) -> bool {
        true
    }

    /// Local files backing this source; the staleness oracle. Sources
    /// without local inputs return an empty list and are never invalidated
    /// by file checks.
    fn source_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Acquire the raw input. Failure is fatal for the attempt and maps to
    /// `source-error`.
    async fn fetch(&self) -> Result<Vec<u8>>;

    /// Interpret raw bytes into the structured payload. Pure; no I/O.
    /// Malformed top-level structure is fatal and maps to `parse-error`.
    fn parse(&self, raw: &[u8]) -> Result<ParseOutput>;

    /// Check content rules. Failing records are dropped and reported as
    /// diagnostics; only malformed payload structure is an error.
    fn validate(&self, payload: Value) -> Result<ValidateOutput>;

    /// Full processing pass: consult the cache and, on a miss, run
    /// fetch/parse/validate and write the result back best-effort.
    async fn process(&self, cache: &dyn CacheStore) -> Result<SourceOutcome> {
        let context = self.context();
        let name = context.name.as_str();
        let base = base_cache_key(self.type_name(), &context.config);
        let key = effective_cache_key(&base, &context.dependencies);

        if self.cache_enabled() {
            let stale = cache
                .is_stale(&key, &self.source_files())
                .await
                .map_err(|err| cache_read_err(err, name))?;

            if !stale {
                let stored = cache
                    .stored_at(&key)
                    .await
                    .map_err(|err| cache_read_err(err, name))?;

                // A usable hit must not predate any dependency's result.
                let usable = stored.map_or(false, |at| {
                    context
                        .dependencies
                        .values()
                        .all(|dep| at >= dep.processed_at)
                });

                if let (Some(stored_at), true) = (stored, usable) {
                    if let Some(payload) =
                        cache.get(&key).await.map_err(|err| cache_read_err(err, name))?
                    {
                        debug!(source = name, key, "cache hit");
                        return Ok(SourceOutcome {
                            payload,
                            diagnostics: Vec::new(),
                            computed_at: stored_at,
                            from_cache: true,
                        });
                    }
                }
            }
        }

        let started = std::time::Instant::now();
        debug!(source = name, key, "cache miss, running phases");

        let raw = self
            .fetch()
            .await
            .map_err(|err| ProcessingError::wrap(err, ErrorCategory::SourceError, name))?;

        let parsed = self
            .parse(&raw)
            .map_err(|err| ProcessingError::wrap(err, ErrorCategory::ParseError, name))?;

        let validated = self
            .validate(parsed.payload)
            .map_err(|err| ProcessingError::wrap(err, ErrorCategory::ValidationError, name))?;

        let validation_errors = validated
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Error)
            .count();
        let validation_warnings = validated.diagnostics.len() - validation_errors;

        let mut payload = validated.payload;
        if let Some(map) = payload.as_object_mut() {
            let metadata = map
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert(
                    "validation".to_string(),
                    serde_json::json!({
                        "total_validated": validated.total_validated,
                        "error_count": validation_errors,
                        "warning_count": validation_warnings,
                    }),
                );
            }
        }

        let mut diagnostics = parsed.diagnostics;
        diagnostics.extend(validated.diagnostics);

        let mut computed_at = Utc::now();
        if self.cache_enabled() {
            match cache.set(&key, &payload).await {
                Ok(()) => {
                    // Report the entry's stored time so dependents and later
                    // runs agree on when this payload was computed.
                    if let Ok(Some(at)) = cache.stored_at(&key).await {
                        computed_at = at;
                    }
                }
                Err(err) => {
                    // Best effort: a failed write never fails the attempt.
                    warn!(source = name, key, error = %err, "cache write failed");
                }
            }
        }

        debug!(
            source = name,
            key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            records = cragdata_common::result::count_records(&payload),
            "source processed"
        );

        Ok(SourceOutcome {
            payload,
            diagnostics,
            computed_at,
            from_cache: false,
        })
    }
}
