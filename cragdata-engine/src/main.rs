//! cragdata-engine - incremental processing of climbing data sources
//!
//! Loads the definition set from TOML configuration, processes every source
//! through the dependency-aware orchestrator, and reports a run summary.
//! Configuration comes from `CRAGDATA_CONFIG` or the platform config
//! directory; there are no command-line options.

use anyhow::Result;
use cragdata_common::config::{resolve_config_path, EngineConfig};
use cragdata_engine::{FsCacheStore, Orchestrator, SourceRegistry};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting cragdata-engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve and load configuration
    let config_path = resolve_config_path(None)?;
    info!("Configuration: {}", config_path.display());
    let config = EngineConfig::load(&config_path)?;
    info!(
        sources = config.sources.len(),
        cache_dir = %config.cache_dir.display(),
        "configuration loaded"
    );

    // Step 2: Open the cache store
    let cache = Arc::new(FsCacheStore::open(&config.cache_dir).await?);

    // Step 3: Build the registry and orchestrator over the definition set
    let registry = SourceRegistry::builtin();
    let mut orchestrator = Orchestrator::new(config.sources, registry, cache)?;

    // Step 4: Process everything
    let stats = orchestrator.process_all().await;

    info!(
        run_id = %stats.run_id,
        succeeded = stats.sources_succeeded,
        failed = stats.sources_failed,
        skipped = stats.sources_skipped,
        records = stats.total_records,
        duration_ms = stats.duration_ms().unwrap_or_default(),
        "run complete"
    );

    if stats.sources_failed > 0 {
        warn!(failed = stats.sources_failed, "exiting with failure status");
        std::process::exit(1);
    }

    Ok(())
}
