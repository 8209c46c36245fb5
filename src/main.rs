//! hermes-index CLI entry point

use clap::{Parser, Subcommand};
use hermes_index::config::Config;
use hermes_index::embed::create_embedder;
use hermes_index::enrich::{require_api_key, EnrichmentWorker};
use hermes_index::error::{Error, Result};
use hermes_index::expand::QueryExpander;
use hermes_index::search::SearchOrchestrator;
use hermes_index::server::{run_server, AppState};
use hermes_index::source::{SourceReader, SourceRegistry};
use hermes_index::state::SyncStateStore;
use hermes_index::store::create_vector_store;
use hermes_index::sync::{spawn_workers, SyncPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hermes-index")]
#[command(version, about = "Semantic search and sync engine for torrent metadata", long_about = None)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "configs/hermes.yaml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the search API with background sync workers
    Serve,

    /// Run sync cycles and exit (or keep cycling with --loop)
    Sync {
        /// Only sync the named source
        #[arg(long)]
        source: Option<String>,

        /// Keep cycling until interrupted
        #[arg(long = "loop")]
        run_loop: bool,
    },

    /// Fill the enrichment table from the TMDB API
    Enrich {
        /// Keep running passes until no candidates remain
        #[arg(long = "loop")]
        run_loop: bool,
    },

    /// Print sync and store statistics as JSON
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        // Misconfiguration and unrecoverable runtime errors exit
        // differently so supervisors can tell them apart.
        std::process::exit(if e.is_config() { 1 } else { 2 });
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Sync { source, run_loop } => sync(config, source, run_loop).await,
        Commands::Enrich { run_loop } => enrich(config, run_loop).await,
        Commands::Status => status(config).await,
    }
}

/// Shared service wiring for serve/sync/status.
struct Services {
    registry: Arc<SourceRegistry>,
    reader: SourceReader,
    state: SyncStateStore,
    store: Arc<hermes_index::store::VectorStore>,
}

async fn build_services(config: &Config) -> Result<Services> {
    let registry = Arc::new(SourceRegistry::new(config.sources.clone())?);
    let state = SyncStateStore::connect(&config.postgres.dsn, &config.bitmagnet.schema).await?;
    state.ensure_schema().await?;
    let reader = SourceReader::new(state.pool().clone());
    let store = Arc::new(create_vector_store(&config.vector_store).await?);
    Ok(Services {
        registry,
        reader,
        state,
        store,
    })
}

/// Broadcast a stop on ctrl-c; in-flight batches finish first.
fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (tx, rx)
}

async fn serve(config: Config) -> Result<()> {
    let services = build_services(&config).await?;
    let embedder: Arc<dyn hermes_index::embed::Embedder> =
        Arc::from(create_embedder(&config.embedding).await?);

    let expander = if config.tmdb.query_expand {
        Some(QueryExpander::new(
            services.state.pool().clone(),
            &config.bitmagnet.schema,
            config.tmdb.query_expand_timeout_ms,
            config.tmdb.query_expand_limit,
        )?)
    } else {
        None
    };

    let orchestrator = Arc::new(SearchOrchestrator::new(
        services.registry.clone(),
        services.reader.clone(),
        services.store.clone(),
        embedder.clone(),
        expander,
        config.nsfw_threshold,
        config.search.clone(),
    ));

    let (stop_tx, stop_rx) = shutdown_channel();
    let pipeline = Arc::new(SyncPipeline::new(
        services.reader.clone(),
        services.state.clone(),
        services.store.clone(),
        embedder.clone(),
    ));
    let mut workers = spawn_workers(pipeline, &config, stop_rx.clone());
    info!("started {} sync workers", workers.len());

    if config.tmdb.enabled && config.tmdb.auto_enrich {
        match require_api_key(&config) {
            Ok(api_key) => {
                let worker = EnrichmentWorker::new(
                    services.state.pool().clone(),
                    &config.bitmagnet.schema,
                    config.tmdb.clone(),
                    api_key,
                )?;
                worker.ensure_table().await?;
                let enrich_stop = stop_rx.clone();
                workers.push(tokio::spawn(async move {
                    if let Err(e) = worker.run_loop(enrich_stop, false).await {
                        error!("enrichment worker stopped: {}", e);
                    }
                }));
                info!("started enrichment worker");
            }
            Err(e) => info!("enrichment disabled: {}", e),
        }
    }

    let app_state = AppState {
        orchestrator,
        registry: services.registry,
        reader: services.reader,
        state: services.state,
        store: services.store,
        search_config: config.search.clone(),
        embedding_version: embedder.version().to_string(),
    };

    let bind = config.server.bind.clone();
    tokio::select! {
        result = run_server(app_state, &bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested, letting in-flight batches finish");
        }
    }

    let _ = stop_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

async fn sync(config: Config, only: Option<String>, run_loop: bool) -> Result<()> {
    let services = build_services(&config).await?;
    let embedder: Arc<dyn hermes_index::embed::Embedder> =
        Arc::from(create_embedder(&config.embedding).await?);
    let pipeline = Arc::new(SyncPipeline::new(
        services.reader,
        services.state,
        services.store,
        embedder,
    ));

    let specs: Vec<_> = config
        .sources
        .iter()
        .filter(|s| only.as_deref().map_or(true, |name| name == s.name))
        .cloned()
        .collect();
    if specs.is_empty() {
        return Err(Error::Config(format!(
            "no sources matched {:?}",
            only.unwrap_or_default()
        )));
    }

    let (stop_tx, stop_rx) = shutdown_channel();

    if run_loop {
        let mut filtered = config.clone();
        filtered.sources = specs;
        let workers = spawn_workers(pipeline, &filtered, stop_rx);
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Io(e))?;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
        return Ok(());
    }

    for spec in &specs {
        let stats = pipeline.sync_source(spec, &stop_rx).await?;
        info!(
            "source {}: scanned={} unchanged={} committed={} failed={}",
            spec.name, stats.scanned, stats.unchanged, stats.committed, stats.failed
        );
    }
    Ok(())
}

async fn enrich(config: Config, run_loop: bool) -> Result<()> {
    let api_key = require_api_key(&config)?;
    let state = SyncStateStore::connect(&config.postgres.dsn, &config.bitmagnet.schema).await?;
    let worker = EnrichmentWorker::new(
        state.pool().clone(),
        &config.bitmagnet.schema,
        config.tmdb.clone(),
        api_key,
    )?;
    worker.ensure_table().await?;

    if run_loop {
        let (stop_tx, stop_rx) = shutdown_channel();
        tokio::select! {
            result = worker.run_loop(stop_rx, true) => result?,
            _ = tokio::signal::ctrl_c() => {
                let _ = stop_tx.send(true);
            }
        }
    } else {
        let stats = worker.run_once().await?;
        info!(
            "enrichment pass: selected={} enriched={} failed={}",
            stats.selected, stats.enriched, stats.failed
        );
    }
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let services = build_services(&config).await?;

    let mut sources = Vec::new();
    for spec in services.registry.iter() {
        let stats = services.state.source_stats(&spec.name).await?;
        let total = services.reader.count(spec).await.unwrap_or(-1);
        sources.push(serde_json::json!({
            "name": spec.name,
            "total": total,
            "tracked": stats.tracked,
            "synced": stats.synced,
            "errors": stats.errors,
            "last_sync_at": stats.last_sync_at,
        }));
    }

    let report = serde_json::json!({
        "vector_store": {
            "kind": services.store.kind(),
            "count": services.store.count().await.unwrap_or(0),
            "healthy": services.store.health().await.is_ok(),
        },
        "sources": sources,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
