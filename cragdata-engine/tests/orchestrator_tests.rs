//! Orchestrator behavior tests.
//!
//! A `scripted` source kind reads its behavior from definition config
//! (records to serve, whether to fail, an optional input file) and counts
//! fetch calls, so these tests can observe caching, staleness propagation,
//! cycle handling, and batch isolation end to end over a real filesystem
//! cache store.

use async_trait::async_trait;
use cragdata_common::{
    Diagnostic, DiagnosticKind, DiagnosticSink, ErrorCategory, MemorySink, ProcessStatus,
    ProcessingError, SourceDefinition,
};
use cragdata_engine::{
    FsCacheStore, Orchestrator, ParseOutput, Source, SourceContext, SourceRegistry, ValidateOutput,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Test double driven entirely by definition config:
///
/// * `records`: array served as the parsed payload's `records` field
/// * `fail_fetch`: fetch returns an error when true
/// * `input_file`: reported as a source file for staleness checks
/// * `drop_invalid`: validate drops records carrying `"invalid": true`
struct ScriptedSource {
    context: SourceContext,
    fetches: Arc<AtomicUsize>,
}

impl ScriptedSource {
    fn flag(&self, key: &str) -> bool {
        self.context
            .config
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn type_name(&self) -> &'static str {
        "scripted"
    }

    fn context(&self) -> &SourceContext {
        &self.context
    }

    fn source_files(&self) -> Vec<PathBuf> {
        self.context
            .config
            .get("input_file")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .into_iter()
            .collect()
    }

    async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.flag("fail_fetch") {
            anyhow::bail!("upstream unreachable");
        }
        Ok(Vec::new())
    }

    fn parse(&self, _raw: &[u8]) -> anyhow::Result<ParseOutput> {
        let records = self
            .context
            .config
            .get("records")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(ParseOutput {
            payload: json!({ "records": records, "metadata": {} }),
            diagnostics: Vec::new(),
        })
    }

    fn validate(&self, mut payload: Value) -> anyhow::Result<ValidateOutput> {
        let mut diagnostics = Vec::new();
        let mut total = 0;
        if let Some(records) = payload.get_mut("records").and_then(Value::as_array_mut) {
            total = records.len();
            if self.flag("drop_invalid") {
                records.retain(|record| {
                    let invalid = record
                        .get("invalid")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if invalid {
                        diagnostics.push(Diagnostic::error(
                            ErrorCategory::ValidationError,
                            &self.context.name,
                            "record marked invalid",
                        ));
                    }
                    !invalid
                });
            }
        }
        Ok(ValidateOutput {
            payload,
            diagnostics,
            total_validated: total,
        })
    }
}

/// Per-source fetch counters shared between the registry and a test body.
#[derive(Default)]
struct FetchCounters {
    by_source: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl FetchCounters {
    fn handle(&self, name: &str) -> Arc<AtomicUsize> {
        let mut map = self.by_source.lock().unwrap();
        Arc::clone(map.entry(name.to_string()).or_default())
    }

    fn count(&self, name: &str) -> usize {
        self.handle(name).load(Ordering::SeqCst)
    }
}

fn scripted_registry(counters: &Arc<FetchCounters>) -> SourceRegistry {
    let counters = Arc::clone(counters);
    let mut registry = SourceRegistry::empty();
    registry.register("scripted", move |context| {
        let fetches = counters.handle(&context.name);
        Ok(Box::new(ScriptedSource { context, fetches }) as Box<dyn Source>)
    });
    registry
}

/// Definition for a scripted source serving two records.
///
/// Cache keys are derived from the config, so the name goes into the config
/// as well to keep distinct definitions from sharing entries.
fn scripted(name: &str) -> SourceDefinition {
    SourceDefinition::new(name)
        .with_kind("scripted")
        .with_config_value("label", json!(name))
        .with_config_value("records", json!([{"name": "r1"}, {"name": "r2"}]))
}

/// Build an orchestrator over a cache store rooted at `cache_dir`, with an
/// in-memory diagnostic sink.
async fn orchestrator_over(
    cache_dir: &Path,
    counters: &Arc<FetchCounters>,
    definitions: Vec<SourceDefinition>,
) -> (Orchestrator, Arc<MemorySink>) {
    let cache = Arc::new(FsCacheStore::open(cache_dir).await.unwrap());
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(definitions, scripted_registry(counters), cache)
        .unwrap()
        .with_sink(Arc::clone(&sink) as Arc<dyn DiagnosticSink>);
    (orchestrator, sink)
}

/// Move a file's modification time `seconds` away from now.
fn shift_mtime(path: &Path, seconds: i64) {
    let target = if seconds >= 0 {
        SystemTime::now() + Duration::from_secs(seconds as u64)
    } else {
        SystemTime::now() - Duration::from_secs(seconds.unsigned_abs())
    };
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(target).unwrap();
}

/// A first run computes the payload and reports it did not come from cache.
#[tokio::test]
async fn first_run_computes_fresh_payload() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let (mut orchestrator, _sink) =
        orchestrator_over(dir.path(), &counters, vec![scripted("areas")]).await;

    let result = orchestrator.process_source("areas").await.unwrap();

    assert_eq!(result.status, ProcessStatus::Completed);
    assert!(!result.from_cache);
    assert_eq!(result.record_count, 2);
    assert_eq!(counters.count("areas"), 1);
}

/// Within one run, a repeated request shares the memoized result object
/// instead of reprocessing.
#[tokio::test]
async fn repeated_request_shares_memoized_result() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let (mut orchestrator, _sink) =
        orchestrator_over(dir.path(), &counters, vec![scripted("areas")]).await;

    let first = orchestrator.process_source("areas").await.unwrap();
    let second = orchestrator.process_source("areas").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(counters.count("areas"), 1);
}

/// A second run over the same cache serves the stored payload without
/// fetching, and keeps the original processing timestamp so downstream
/// cache keys stay stable.
#[tokio::test]
async fn second_run_hits_cache() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());

    let (mut first_run, _sink) =
        orchestrator_over(dir.path(), &counters, vec![scripted("areas")]).await;
    let first = first_run.process_source("areas").await.unwrap();
    drop(first_run);

    let (mut second_run, _sink) =
        orchestrator_over(dir.path(), &counters, vec![scripted("areas")]).await;
    let second = second_run.process_source("areas").await.unwrap();

    assert!(second.from_cache);
    assert_eq!(second.payload, first.payload);
    assert_eq!(second.processed_at, first.processed_at);
    assert_eq!(counters.count("areas"), 1);
    // Cached results still count as successes with their records.
    assert_eq!(second_run.statistics().sources_succeeded, 1);
    assert_eq!(second_run.statistics().total_records, 2);
}

/// Touching a source's input file invalidates its cache entry.
#[tokio::test]
async fn modified_input_file_forces_recompute() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("export.json");
    std::fs::write(&input, b"{}").unwrap();
    let definition = scripted("areas")
        .with_config_value("input_file", json!(input.to_string_lossy()));
    let counters = Arc::new(FetchCounters::default());

    let (mut first_run, _sink) =
        orchestrator_over(dir.path(), &counters, vec![definition.clone()]).await;
    first_run.process_source("areas").await.unwrap();
    assert_eq!(counters.count("areas"), 1);
    drop(first_run);

    shift_mtime(&input, 5);

    let (mut second_run, _sink) =
        orchestrator_over(dir.path(), &counters, vec![definition]).await;
    let recomputed = second_run.process_source("areas").await.unwrap();

    assert!(!recomputed.from_cache);
    assert_eq!(counters.count("areas"), 2);
}

/// A recomputed dependency invalidates its dependents, while untouched
/// inputs leave the whole chain served from cache.
#[tokio::test]
async fn dependency_recompute_propagates_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("areas.json");
    std::fs::write(&input, b"{}").unwrap();
    let definitions = || {
        vec![
            scripted("areas").with_config_value("input_file", json!(input.to_string_lossy())),
            scripted("routes").with_dependencies(["areas"]),
        ]
    };
    let counters = Arc::new(FetchCounters::default());

    // First run computes both.
    let (mut run, _sink) = orchestrator_over(dir.path(), &counters, definitions()).await;
    run.process_all().await;
    assert_eq!(counters.count("areas"), 1);
    assert_eq!(counters.count("routes"), 1);
    drop(run);

    // Nothing changed: both come from cache.
    let (mut run, _sink) = orchestrator_over(dir.path(), &counters, definitions()).await;
    run.process_all().await;
    assert!(run.memoized("areas").unwrap().from_cache);
    assert!(run.memoized("routes").unwrap().from_cache);
    assert_eq!(counters.count("areas"), 1);
    assert_eq!(counters.count("routes"), 1);
    drop(run);

    // The upstream input changed: areas recomputes, and its newer result
    // timestamp pushes routes out of cache too.
    shift_mtime(&input, 5);
    let (mut run, _sink) = orchestrator_over(dir.path(), &counters, definitions()).await;
    run.process_all().await;
    assert!(!run.memoized("areas").unwrap().from_cache);
    assert!(!run.memoized("routes").unwrap().from_cache);
    assert_eq!(counters.count("areas"), 2);
    assert_eq!(counters.count("routes"), 2);
}

/// Dependents declared before their dependencies still resolve depth-first.
#[tokio::test]
async fn declaration_order_does_not_matter() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![
        scripted("routes").with_dependencies(["areas"]),
        scripted("areas"),
    ];
    let (mut orchestrator, _sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let stats = orchestrator.process_all().await;

    assert_eq!(stats.sources_succeeded, 2);
    assert_eq!(counters.count("areas"), 1);
    assert_eq!(counters.count("routes"), 1);
}

/// A dependency cycle fails with the full resolution path and no fetches.
#[tokio::test]
async fn cycle_reports_full_path() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![
        scripted("a").with_dependencies(["b"]),
        scripted("b").with_dependencies(["a"]),
    ];
    let (mut orchestrator, sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let err = orchestrator.process_source("a").await.unwrap_err();

    let processing = err.downcast_ref::<ProcessingError>().unwrap();
    assert_eq!(processing.category, ErrorCategory::ConfigError);
    assert!(processing.message.contains("a -> b -> a"), "{}", processing.message);
    assert_eq!(
        processing.context.as_ref().unwrap()["cycle"],
        json!(["a", "b", "a"])
    );

    // Both nodes reached a terminal failed state without fetching.
    assert_eq!(orchestrator.memoized("a").unwrap().status, ProcessStatus::Error);
    assert_eq!(orchestrator.memoized("b").unwrap().status, ProcessStatus::Error);
    assert_eq!(counters.count("a"), 0);
    assert_eq!(counters.count("b"), 0);

    // The loop is reported once, where it closed.
    assert_eq!(sink.snapshot().len(), 1);
}

/// A failed dependency fails its dependents with the original attribution.
#[tokio::test]
async fn failed_dependency_keeps_origin_attribution() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![
        scripted("broken").with_config_value("fail_fetch", json!(true)),
        scripted("dependent").with_dependencies(["broken"]),
    ];
    let (mut orchestrator, sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let err = orchestrator.process_source("dependent").await.unwrap_err();

    let processing = err.downcast_ref::<ProcessingError>().unwrap();
    assert_eq!(processing.source_name, "broken");
    assert_eq!(processing.category, ErrorCategory::SourceError);

    // The dependent never ran its phases, and both count as failed.
    assert_eq!(counters.count("dependent"), 0);
    assert_eq!(orchestrator.statistics().sources_failed, 2);

    // One diagnostic, at the failure's origin.
    let collected = sink.snapshot();
    assert_eq!(collected.len(), 1);
    assert_eq!(collected[0].source_name, "broken");
}

/// One failing source does not abort the rest of the batch.
#[tokio::test]
async fn batch_continues_after_individual_failure() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![
        scripted("broken").with_config_value("fail_fetch", json!(true)),
        scripted("healthy"),
    ];
    let (mut orchestrator, _sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let stats = orchestrator.process_all().await;

    assert_eq!(stats.sources_processed, 2);
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.sources_succeeded, 1);
    assert_eq!(stats.total_records, 2);
    assert!(stats.finished_at.is_some());
    assert!(stats.duration_ms().is_some());

    let healthy = orchestrator.memoized("healthy").unwrap();
    assert_eq!(healthy.status, ProcessStatus::Completed);
    assert_eq!(healthy.record_count, 2);
}

/// A memoized failure re-raises on later requests without another attempt.
#[tokio::test]
async fn memoized_failure_reraises_without_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![scripted("broken").with_config_value("fail_fetch", json!(true))];
    let (mut orchestrator, sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let first = orchestrator.process_source("broken").await.unwrap_err();
    let second = orchestrator.process_source("broken").await.unwrap_err();

    assert_eq!(counters.count("broken"), 1);
    for err in [&first, &second] {
        let processing = err.downcast_ref::<ProcessingError>().unwrap();
        assert_eq!(processing.category, ErrorCategory::SourceError);
        assert_eq!(processing.source_name, "broken");
    }
    // The failure was reported once, not once per request.
    assert_eq!(sink.snapshot().len(), 1);
}

/// Disabled definitions skip without fetching, caching, or diagnostics.
#[tokio::test]
async fn disabled_definition_skips_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![scripted("dormant").disabled()];
    let (mut orchestrator, sink) = orchestrator_over(&cache_dir, &counters, definitions).await;

    let result = orchestrator.process_source("dormant").await.unwrap();

    assert_eq!(result.status, ProcessStatus::Skipped);
    assert_eq!(result.payload, Value::Null);
    assert_eq!(counters.count("dormant"), 0);
    assert!(sink.is_empty());
    assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 0);
}

/// A disabled dependency yields a skipped result, not a failure, and the
/// dependent still processes.
#[tokio::test]
async fn disabled_dependency_does_not_fail_dependent() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![
        scripted("base").disabled(),
        scripted("dependent").with_dependencies(["base"]),
    ];
    let (mut orchestrator, _sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let result = orchestrator.process_source("dependent").await.unwrap();

    assert_eq!(result.status, ProcessStatus::Completed);
    assert_eq!(
        orchestrator.memoized("base").unwrap().status,
        ProcessStatus::Skipped
    );
}

/// Records rejected during validation are dropped from the payload and
/// surface as diagnostics in the run statistics.
#[tokio::test]
async fn validation_failures_surface_in_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let definitions = vec![scripted("areas")
        .with_config_value(
            "records",
            json!([{"name": "ok1"}, {"name": "ok2"}, {"name": "bad", "invalid": true}]),
        )
        .with_config_value("drop_invalid", json!(true))];
    let (mut orchestrator, sink) = orchestrator_over(dir.path(), &counters, definitions).await;

    let stats = orchestrator.process_all().await;

    assert_eq!(stats.sources_succeeded, 1);
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.count_by_kind(DiagnosticKind::Error), 1);
    assert_eq!(sink.snapshot().len(), 1);

    let areas = orchestrator.memoized("areas").unwrap();
    let validation = &areas.payload["metadata"]["validation"];
    assert_eq!(validation["total_validated"], json!(3));
    assert_eq!(validation["error_count"], json!(1));
    assert_eq!(validation["warning_count"], json!(0));
}

/// Requesting a name with no definition is a configuration error.
#[tokio::test]
async fn unknown_source_name_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let (mut orchestrator, _sink) =
        orchestrator_over(dir.path(), &counters, vec![scripted("areas")]).await;

    let err = orchestrator.process_source("ghost").await.unwrap_err();

    let processing = err.downcast_ref::<ProcessingError>().unwrap();
    assert_eq!(processing.category, ErrorCategory::ConfigError);
    assert_eq!(processing.source_name, "ghost");
    assert!(processing.message.contains("unknown source"));
}

/// A definition whose kind has no registered factory fails construction,
/// before anything runs.
#[tokio::test]
async fn unregistered_kind_fails_at_construction() {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(FetchCounters::default());
    let cache = Arc::new(FsCacheStore::open(dir.path()).await.unwrap());
    let definitions = vec![SourceDefinition::new("weird").with_kind("mystery")];

    let err = Orchestrator::new(definitions, scripted_registry(&counters), cache).unwrap_err();

    assert_eq!(err.category, ErrorCategory::ConfigError);
    assert_eq!(err.source_name, "weird");
}

/// Cache writes are best-effort: when the store becomes unwritable the
/// payload is still produced and the source completes.
#[tokio::test]
async fn cache_write_failure_still_returns_payload() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("cache");
    let counters = Arc::new(FetchCounters::default());
    let (mut orchestrator, _sink) =
        orchestrator_over(&cache_dir, &counters, vec![scripted("areas")]).await;

    // Replace the store directory with a regular file so writes fail.
    std::fs::remove_dir_all(&cache_dir).unwrap();
    std::fs::write(&cache_dir, b"not a directory").unwrap();

    let result = orchestrator.process_source("areas").await.unwrap();

    assert_eq!(result.status, ProcessStatus::Completed);
    assert!(!result.from_cache);
    assert_eq!(result.record_count, 2);
}
