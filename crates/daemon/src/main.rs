//! Taskbed - Main Entry Point
//! Wires the SQLite store, the persistent and ephemeral job engines and the
//! live queue, then runs until Ctrl+C.

mod settings;

use anyhow::{Context, Result};
use settings::{LogFormat, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use taskbed_core::application::jobs::{define_id_memento_cron, load_id_memento, save_id_memento};
use taskbed_core::application::worker::constants::LIVE_SWEEP_INTERVAL;
use taskbed_core::application::{
    shutdown_channel, ContextFactory, EphemeralEngine, EphemeralOptions, JobEngine, LiveQueue,
    Schema,
};
use taskbed_core::domain::IdGenerator;
use taskbed_core::port::{NoCache, SystemTimeProvider, TimeProvider};
use taskbed_infra_sqlite::{create_pool, run_migrations, SqliteStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    // 1. Initialize logging
    let (log_writer, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("taskbed=info"))
        .context("building log filter")?;

    match settings.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(log_writer))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(log_writer))
            .init(),
    }

    info!("Taskbed v{} starting...", VERSION);

    // 2. Initialize database
    if let Some(dir) = Path::new(&settings.db_path).parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }
    info!(db_path = %settings.db_path, "Initializing database...");
    let pool = create_pool(&settings.database_url())
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 3. Setup dependencies
    let clock: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let contexts = ContextFactory::new(Arc::new(SqliteStore::new(pool.clone())), Arc::new(NoCache));
    let engine_config = &settings.engine;

    let memento = load_id_memento(&mut contexts.new_context("startup"))
        .await
        .context("loading ID memento")?;
    let ids = Arc::new(IdGenerator::new(engine_config.node_id, memento));
    info!(node = engine_config.node_id, memento, "ID generator ready");

    let mut schema = Schema::new();
    define_id_memento_cron(&mut schema, ids.clone());
    let schema = Arc::new(schema);

    // 4. Start engines
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let jobs = Arc::new(JobEngine::new(
        schema.clone(),
        ids.clone(),
        clock.clone(),
        contexts.clone(),
        engine_config.idle_poll_interval(),
    ));
    let mut handles = jobs
        .start(engine_config.worker_count, shutdown_rx.clone())
        .await
        .context("starting job engine")?;

    let ephemeral = Arc::new(EphemeralEngine::new(
        schema,
        contexts.clone(),
        EphemeralOptions {
            queue_max_size: engine_config.ephemeral_queue_max_size,
            queue_full: engine_config.ephemeral_queue_full,
            inline: engine_config.inline_ephemeral,
        },
    ));
    handles.extend(ephemeral.start(engine_config.ephemeral_worker_count, shutdown_rx.clone()));

    let live = Arc::new(LiveQueue::new(
        engine_config.live_ttl(),
        engine_config.live_max_messages_per_channel,
        clock,
    ));
    handles.push(tokio::spawn(
        live.run_sweeper(LIVE_SWEEP_INTERVAL, shutdown_rx),
    ));

    info!("System ready. Press Ctrl+C to shutdown");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 6. Graceful shutdown: in-flight jobs finish, then the memento is saved
    shutdown_tx.shutdown();
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, join_workers(handles)).await;
    if drained.is_err() {
        warn!("Workers did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }

    if let Err(e) = save_id_memento(&mut contexts.new_context("shutdown"), &ids).await {
        error!(error = %e, "Failed to save ID memento");
    }
    pool.close().await;

    info!("Shutdown complete.");
    Ok(())
}

async fn join_workers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task failed");
        }
    }
}
