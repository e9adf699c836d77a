//! WattWise pipeline server
//!
//! Runs the outbox relay, the three event consumers and the goal window
//! sweeper against `PostgreSQL` and `RedPanda`.
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin wattwise-server
//! ```

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wattwise_core::environment::SystemClock;
use wattwise_pipeline::{Config, Dependencies, Pipeline, StoreSubscriberDirectory, shutdown_signal};
use wattwise_postgres::{
    MIGRATOR, PostgresDeadLetterQueue, PostgresRecordStore, PostgresSequenceLedger,
};
use wattwise_redpanda::RedpandaEventBus;
use wattwise_runtime::metrics::MetricsExporter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        redpanda = %config.redpanda.brokers,
        comparison = %config.goals.comparison,
        "Configuration loaded"
    );

    let mut exporter = MetricsExporter::new(config.server.metrics_addr);
    exporter.start()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .idle_timeout(Duration::from_secs(config.postgres.idle_timeout))
        .connect(&config.postgres.url)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PostgresRecordStore::new(pool.clone()));
    let bus = RedpandaEventBus::builder()
        .brokers(config.redpanda.brokers.clone())
        .producer_acks(config.redpanda.acks.clone())
        .group_prefix(config.redpanda.group_prefix.clone())
        .timeout(config.send_timeout())
        .build()?;

    let deps = Dependencies {
        records: store.clone(),
        outbox: store.clone(),
        ledger: Arc::new(PostgresSequenceLedger::new(pool.clone())),
        dead_letters: Arc::new(PostgresDeadLetterQueue::new(pool)),
        bus: Arc::new(bus),
        clock: Arc::new(SystemClock),
        directory: Arc::new(StoreSubscriberDirectory::new(store)),
    };

    let pipeline = Pipeline::new(deps, &config);
    let running = pipeline.start();

    let report = pipeline.health().report().await;
    tracing::info!(status = %report.status, tasks = ?running.tasks(), "WattWise pipeline running");
    tracing::info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    running.shutdown().await;
    Ok(())
}
