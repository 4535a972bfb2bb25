//! Engine binary for the Weft semantic store.
//!
//! Wires the durable store, the event bus, the spatial cache, the physics
//! processor, the workflow janitor and the command intake together, and
//! runs them until ctrl-c.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `weft-config.yaml` (env overrides applied)
//! 2. Initialize structured logging (tracing)
//! 3. Connect the durable store (`PostgreSQL` + migrations, or in-process)
//! 4. Connect the event bus (NATS, or in-process)
//! 5. Start the check batcher and the commit service
//! 6. Subscribe live-sync, then hydrate the spatial cache
//! 7. Spawn live-sync, the physics processor and the janitor
//! 8. Start the command intake (NATS bus only)
//! 9. Wait for ctrl-c, signal shutdown, drain the tasks

mod error;
mod intake;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weft_cache::{CacheConfig, LiveSync, SpatialCache};
use weft_core::config::{BusBackend, InfrastructureConfig, LoggingConfig, StoreBackend};
use weft_core::{
    CheckBatcher, CommitService, DerivationStrategy, HashPlacement, Janitor, PhysicsProcessor,
    WeftConfig,
};
use weft_db::{DurableStore, MemoryStore, PgStore, PostgresConfig, PostgresPool};
use weft_events::{EventBus, InMemoryBus, NatsEventBus};

use crate::error::EngineError;
use crate::intake::CommandIntake;

const CONFIG_PATH: &str = "weft-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any initialization step fails, or if live-sync
/// stops because the cache could not be re-hydrated.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = Path::new(CONFIG_PATH);
    let config_found = config_path.exists();
    let config = if config_found {
        WeftConfig::from_file(config_path)?
    } else {
        WeftConfig::parse("")?
    };

    // 2. Initialize structured logging.
    init_logging(&config.logging);
    info!("weft-engine starting");
    if !config_found {
        info!(path = CONFIG_PATH, "Config file not found, using defaults");
    }
    info!(
        store_backend = ?config.infrastructure.store_backend,
        bus_backend = ?config.infrastructure.bus_backend,
        partition_index = config.cache.partition_index,
        partition_count = config.cache.partition_count,
        relationship_rules = config.relationships.len(),
        "Configuration loaded"
    );

    // 3-4. Store and bus.
    let store = connect_store(&config.infrastructure).await?;
    let bus = connect_bus(&config.infrastructure).await?;

    // 5. Commit path.
    let (checker, _checker_task) = CheckBatcher::spawn(
        Arc::clone(&store),
        config.commit.check_max_batch,
        config.commit.check_queue_depth,
    );
    let strategy: Arc<dyn DerivationStrategy> = Arc::new(HashPlacement);
    let service = Arc::new(CommitService::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        checker,
        Arc::clone(&strategy),
        &config,
    ));
    info!(
        revalidation_attempts = config.commit.revalidation_attempts,
        "Commit service ready"
    );

    // 6. Cache: subscribe before the bulk read so nothing is missed.
    let cache_config = CacheConfig {
        cell_size: config.cache.cell_size,
        hydration_retry: config.cache.hydration_retry(),
        ..CacheConfig::default()
    }
    .with_partition(config.cache.partition());
    let cache = Arc::new(SpatialCache::new(cache_config, Arc::clone(&store))?);
    let sync = LiveSync::subscribe(Arc::clone(&cache), bus.as_ref()).await?;
    let hydration = cache.initialize().await?;
    info!(
        generation = hydration.generation,
        rows_read = hydration.rows_read,
        nodes = hydration.nodes,
        "Spatial cache hydrated"
    );

    // 7. Background consumers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sync_task = tokio::spawn(sync.run(shutdown_rx.clone()));

    let processor = PhysicsProcessor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        strategy,
        config.commit.store_retry(),
        config.commit.event_retry(),
    );
    let process_stream = processor.subscribe().await?;
    let physics_task = tokio::spawn(processor.run(process_stream, shutdown_rx.clone()));

    let janitor = Janitor::new(Arc::clone(&store), &config.workflow);
    let janitor_task = tokio::spawn(janitor.run(shutdown_rx.clone()));

    // 8. Command intake.
    let intake_task = match config.infrastructure.bus_backend {
        BusBackend::Nats => {
            let intake =
                CommandIntake::connect(&config.infrastructure.nats_url, Arc::clone(&service))
                    .await?;
            Some(tokio::spawn(intake.run(shutdown_rx.clone())))
        }
        BusBackend::Memory => {
            info!("Command intake disabled: the in-process bus has no external callers");
            None
        }
    };

    info!("weft-engine running; press ctrl-c to stop");

    // 9. Run until ctrl-c, or until live-sync gives up.
    let early_sync_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for ctrl-c; shutting down");
            }
            info!("Shutdown requested");
            None
        }
        joined = &mut sync_task => Some(joined),
    };
    let _ = shutdown_tx.send(true);

    let sync_joined = match early_sync_exit {
        Some(joined) => joined,
        None => sync_task.await,
    };
    let physics = physics_task
        .await
        .map_err(|e| task_failed("physics", &e))?;
    let reclaimed = janitor_task
        .await
        .map_err(|e| task_failed("janitor", &e))?;
    if let Some(task) = intake_task {
        let received = task.await.map_err(|e| task_failed("intake", &e))??;
        info!(received, "Command intake drained");
    }
    let stats = cache.shutdown();

    info!(
        derived = physics.derived,
        skipped = physics.skipped,
        failed = physics.failed,
        reclaimed,
        nodes = stats.nodes,
        generation = stats.generation,
        "Background tasks stopped"
    );

    // Live-sync failure is fatal; report it last so the others drain.
    let sync_report = sync_joined.map_err(|e| task_failed("live_sync", &e))??;
    info!(
        applied = sync_report.applied,
        rehydrations = sync_report.rehydrations,
        "weft-engine shutdown complete"
    );
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_store(
    infrastructure: &InfrastructureConfig,
) -> Result<Arc<dyn DurableStore>, EngineError> {
    match infrastructure.store_backend {
        StoreBackend::Postgres => {
            let pg_config = PostgresConfig::new(&infrastructure.postgres_url)
                .with_max_connections(infrastructure.max_connections)
                .with_connect_retry(infrastructure.connect_retry());
            let pool = PostgresPool::connect(&pg_config).await?;
            pool.run_migrations().await?;
            Ok(Arc::new(PgStore::new(&pool)))
        }
        StoreBackend::Memory => {
            warn!("Using the in-process store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn connect_bus(
    infrastructure: &InfrastructureConfig,
) -> Result<Arc<dyn EventBus>, EngineError> {
    match infrastructure.bus_backend {
        BusBackend::Nats => {
            let bus =
                NatsEventBus::connect(&infrastructure.nats_url, &infrastructure.connect_retry())
                    .await?;
            Ok(Arc::new(bus))
        }
        BusBackend::Memory => {
            warn!("Using the in-process bus; events stay inside this process");
            Ok(Arc::new(InMemoryBus::new()))
        }
    }
}

fn task_failed(task: &'static str, error: &JoinError) -> EngineError {
    EngineError::Task {
        task,
        message: error.to_string(),
    }
}
