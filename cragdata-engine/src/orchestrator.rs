//! Run orchestration: dependency resolution, memoization, cycle detection,
//! and batch statistics.
//!
//! One [`Orchestrator`] value owns the state of one run. Sources are
//! resolved depth-first in declaration order; every source reaches exactly
//! one terminal state per run, and that state is memoized so repeated
//! requests (including diamond-shaped dependency graphs) share the same
//! result.

use anyhow::Result;
use cragdata_common::{
    definition::validate_definitions, Diagnostic, DiagnosticSink, ProcessingError,
    ProcessingResult, RunStatistics, SourceDefinition, TracingSink,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::registry::SourceRegistry;
use crate::source::SourceContext;

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Coordinates one processing run over a definition set.
///
/// Create a fresh orchestrator per run; the memo map and statistics live as
/// long as the value and are never shared between runs.
pub struct Orchestrator {
    definitions: Vec<SourceDefinition>,
    registry: SourceRegistry,
    cache: Arc<dyn CacheStore>,
    sink: Arc<dyn DiagnosticSink>,
    /// Terminal results by source name; failures memoize too and re-raise
    memo: HashMap<String, Arc<ProcessingResult>>,
    /// Names currently being resolved; a repeat means the graph loops
    resolution_stack: Vec<String>,
    statistics: RunStatistics,
}

impl Orchestrator {
    /// Build an orchestrator over a validated definition set.
    ///
    /// Definition-set defects (duplicate names, undefined dependencies,
    /// unregistered kinds) fail here, before any processing.
    pub fn new(
        definitions: Vec<SourceDefinition>,
        registry: SourceRegistry,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, ProcessingError> {
        validate_definitions(&definitions)?;
        registry.check_definitions(&definitions)?;

        Ok(Self {
            definitions,
            registry,
            cache,
            sink: Arc::new(TracingSink),
            memo: HashMap::new(),
            resolution_stack: Vec::new(),
            statistics: RunStatistics::new(),
        })
    }

    /// Replace the default tracing sink
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Process one source by name, resolving its dependencies first.
    ///
    /// Errors propagate to the caller. The terminal state (success or
    /// failure) is memoized; a later request for a failed source re-raises
    /// the same error without reprocessing.
    pub async fn process_source(&mut self, name: &str) -> Result<Arc<ProcessingResult>> {
        self.process_inner(name).await
    }

    /// Process every definition in declaration order.
    ///
    /// Individual failures are recorded in the statistics and do not abort
    /// the batch.
    pub async fn process_all(&mut self) -> RunStatistics {
        let names: Vec<String> = self.definitions.iter().map(|d| d.name.clone()).collect();
        info!(
            run_id = %self.statistics.run_id,
            sources = names.len(),
            "starting batch run"
        );

        for name in &names {
            if let Err(err) = self.process_inner(name).await {
                // Already memoized and counted; the batch keeps going.
                warn!(source = %name, error = %err, "continuing after source failure");
            }
        }

        self.statistics.finish();
        let stats = self.statistics.clone();
        info!(
            run_id = %stats.run_id,
            succeeded = stats.sources_succeeded,
            failed = stats.sources_failed,
            skipped = stats.sources_skipped,
            records = stats.total_records,
            duration_ms = stats.duration_ms().unwrap_or_default(),
            "batch run finished"
        );
        stats
    }

    /// Result memoized for `name` this run, if any
    pub fn memoized(&self, name: &str) -> Option<Arc<ProcessingResult>> {
        self.memo.get(name).map(Arc::clone)
    }

    /// Statistics accumulated by this orchestrator so far
    pub fn statistics(&self) -> &RunStatistics {
        &self.statistics
    }

    fn find_definition(&self, name: &str) -> Option<&SourceDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.name == name)
    }

    /// Record a failure as this source's terminal state and return the
    /// error to propagate.
    fn fail(&mut self, name: &str, err: &anyhow::Error, elapsed: u64) -> anyhow::Error {
        let attributed = ProcessingError::from_anyhow(err, name);
        error!(
            source = name,
            category = %attributed.category,
            error = %attributed,
            "source processing failed"
        );

        // Inherited dependency failures were already reported at their
        // origin; only failures originating here produce a diagnostic.
        if attributed.source_name == name {
            let diagnostic = Diagnostic::from_error(&attributed);
            self.sink.emit(&diagnostic);
            self.statistics.diagnostics.push(diagnostic);
        }

        let result = Arc::new(ProcessingResult::failed(name, attributed.clone(), elapsed));
        self.memo.insert(name.to_string(), Arc::clone(&result));
        self.statistics.record(&result);

        anyhow::Error::new(attributed)
    }

    fn process_inner<'a>(
        &'a mut self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<ProcessingResult>>> + Send + 'a>> {
        Box::pin(async move {
            // Memoized terminal state: successes share, failures re-raise.
            if let Some(result) = self.memo.get(name) {
                let result = Arc::clone(result);
                debug!(source = name, status = ?result.status, "memoized result");
                if let Some(err) = &result.error {
                    return Err(anyhow::Error::new(err.clone()));
                }
                return Ok(result);
            }

            // A name already being resolved means the dependency graph
            // loops. Report the full path; the requesting frames record
            // their own failures as the error unwinds.
            if self.resolution_stack.iter().any(|entry| entry == name) {
                let mut cycle: Vec<&str> =
                    self.resolution_stack.iter().map(String::as_str).collect();
                cycle.push(name);
                let path = cycle.join(" -> ");
                let err = ProcessingError::config(
                    name,
                    format!("circular dependency: {path}"),
                )
                .with_context(serde_json::json!({ "cycle": cycle }));
                return Err(anyhow::Error::new(err));
            }

            let started = Instant::now();

            let definition = match self.find_definition(name) {
                Some(definition) => definition.clone(),
                None => {
                    let err = ProcessingError::config(name, format!("unknown source '{name}'"));
                    return Err(self.fail(name, &anyhow::Error::new(err), 0));
                }
            };

            // Disabled definitions short-circuit: no cache lookup, no
            // fetch, no diagnostics.
            if !definition.enabled {
                debug!(source = name, "definition disabled, skipping");
                let result = Arc::new(ProcessingResult::skipped(name));
                self.memo.insert(name.to_string(), Arc::clone(&result));
                self.statistics.record(&result);
                return Ok(result);
            }

            // Resolve direct dependencies depth-first, in declaration
            // order. The name stays on the stack only for this window.
            self.resolution_stack.push(name.to_string());
            let mut dependencies = BTreeMap::new();
            for dep_name in &definition.dependencies {
                match self.process_inner(dep_name).await {
                    Ok(dep_result) => {
                        dependencies.insert(dep_name.clone(), dep_result);
                    }
                    Err(err) => {
                        self.resolution_stack.pop();
                        return Err(self.fail(name, &err, elapsed_ms(started)));
                    }
                }
            }
            self.resolution_stack.pop();

            let context = SourceContext::new(name, definition.config.clone(), dependencies);
            let source = match self.registry.instantiate(&definition, context) {
                Ok(source) => source,
                Err(err) => {
                    return Err(self.fail(name, &anyhow::Error::new(err), elapsed_ms(started)));
                }
            };

            let outcome = match source.process(self.cache.as_ref()).await {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.fail(name, &err, elapsed_ms(started))),
            };

            for diagnostic in &outcome.diagnostics {
                self.sink.emit(diagnostic);
            }
            self.statistics.diagnostics.extend(outcome.diagnostics);

            let result = Arc::new(ProcessingResult::completed(
                name,
                outcome.payload,
                outcome.computed_at,
                elapsed_ms(started),
                outcome.from_cache,
            ));
            info!(
                source = name,
                records = result.record_count,
                from_cache = result.from_cache,
                elapsed_ms = result.processing_time_ms,
                "source completed"
            );

            self.memo.insert(name.to_string(), Arc::clone(&result));
            self.statistics.record(&result);
            Ok(result)
        })
    }
}
