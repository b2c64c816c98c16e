//! MarketPrism Tiered Storage Engine entry point: wires up both tiers'
//! schema, the batch queue and tier writer, the bus subscribers, the
//! migration and cleanup engines, the scheduler, and the admin HTTP
//! surface, then runs until a shutdown signal drains the queue.

mod admin;
mod bus;
mod cleanup;
mod config;
mod error;
mod metrics;
mod middleware;
mod migration;
mod model;
mod queue;
mod scheduler;
mod shutdown;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use config::Settings;
use queue::{BatchQueueManager, TierWriter};
use std::net::SocketAddr;
use std::sync::Arc;
use store::{ConnectionPool, SchemaManager, StoreClient, Tier};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "marketprism-storage")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "STORAGE_CONFIG", default_value = "config/storage.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load(&cli.config).context("loading configuration")?;
    let prometheus_handle = metrics::install();

    info!("starting marketprism tiered storage engine");

    let hot_client = StoreClient::new(&settings.hot.store).context("constructing hot store client")?;
    let cold_client = StoreClient::new(&settings.cold.store).context("constructing cold store client")?;

    SchemaManager::new(hot_client.clone(), Tier::Hot, settings.hot.ttl_days)
        .initialize()
        .await
        .context("initializing hot tier schema")?;
    SchemaManager::new(cold_client.clone(), Tier::Cold, settings.cold.ttl_days)
        .initialize()
        .await
        .context("initializing cold tier schema")?;

    let hot_pool = ConnectionPool::with_label(hot_client.clone(), &settings.pool, "hot");
    let cold_pool = ConnectionPool::with_label(cold_client.clone(), &settings.pool, "cold");

    let hot_writer = Arc::new(TierWriter::new(hot_pool.clone(), settings.retry.clone(), "hot"));
    let queue = BatchQueueManager::new(hot_writer.clone());

    let subscriber_stats = Arc::new(bus::SubscriberStats::default());
    let subscriber = Arc::new(bus::BusSubscriber::new(
        settings.bus.clone(),
        queue.clone(),
        subscriber_stats.clone(),
    ));

    let migration_engine = Arc::new(
        migration::MigrationEngine::new(hot_client.clone(), cold_client.clone(), settings.migration.clone())
            .with_retry(settings.retry.clone()),
    );

    let hot_cleanup_tables: Vec<String> = model::DataType::ALL
        .iter()
        .map(|dt| format!("hot_{}", dt.table_name()))
        .collect();
    let cold_cleanup_tables: Vec<String> = model::DataType::ALL
        .iter()
        .map(|dt| format!("cold_{}", dt.table_name()))
        .collect();

    let mut cleanup_engines = Vec::new();
    if settings.mode.runs_hot_cleanup() {
        cleanup_engines.push(Arc::new(cleanup::CleanupEngine::new(
            hot_client.clone(),
            hot_cleanup_tables,
            settings.cleanup.clone(),
        )));
    }
    if settings.mode.runs_cold_cleanup() {
        cleanup_engines.push(Arc::new(cleanup::CleanupEngine::new(
            cold_client.clone(),
            cold_cleanup_tables,
            settings.cleanup.clone(),
        )));
    }

    let facade = Arc::new(admin::AdminFacade::new(
        settings.clone(),
        queue.clone(),
        hot_writer.clone(),
        hot_pool.clone(),
        cold_pool.clone(),
        subscriber_stats.clone(),
        migration_engine.clone(),
        cleanup_engines,
    ));

    let (scheduler, scheduler_shutdown_rx) = scheduler::Scheduler::new();
    let (bus_shutdown_tx, bus_shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let facade = facade.clone();
        scheduler.spawn_task(
            "migration",
            &settings.migration.schedule_cron,
            scheduler_shutdown_rx.clone(),
            move || {
                let facade = facade.clone();
                async move {
                    facade.trigger_migration().await;
                }
            },
        )?;
    }
    {
        let facade = facade.clone();
        scheduler.spawn_task(
            "cleanup",
            &settings.cleanup.schedule_cron,
            scheduler_shutdown_rx.clone(),
            move || {
                let facade = facade.clone();
                async move {
                    facade.trigger_cleanup().await;
                }
            },
        )?;
    }

    tokio::spawn(queue.clone().run_maintenance_loop());
    if settings.mode.ingests() {
        tokio::spawn(subscriber.run_all(bus_shutdown_rx));
    } else {
        info!(mode = ?settings.mode, "ingestion disabled for this mode; not starting the bus subscriber");
    }

    let admin_bind: SocketAddr = settings.admin.bind.parse().context("parsing admin.bind address")?;
    let app = admin::router(facade, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(admin_bind)
        .await
        .context("binding admin HTTP listener")?;
    info!(addr = %admin_bind, "admin HTTP surface listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let grace = std::time::Duration::from_secs(settings.shutdown_grace_secs);
    tokio::select! {
        result = server => {
            result.context("admin HTTP server exited unexpectedly")?;
        }
        report = shutdown::wait_and_drain(bus_shutdown_tx, queue.clone(), grace) => {
            scheduler.request_shutdown();
            info!(?report, "shutdown complete");
        }
    }

    Ok(())
}
