use std::sync::Arc;

use anyhow::Context;
use skiff_atc::config::Config;
use skiff_atc::db;
use skiff_atc::gc::ContainerCollector;
use skiff_atc::lifecycle::WorkerLifecycle;
use skiff_atc::provider::HttpClientFactory;
use skiff_atc::registry::PgRegistry;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff_atc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Skiff ATC...");

    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let registry = Arc::new(PgRegistry::new(pool));

    let collector = ContainerCollector::new(
        registry.clone(),
        registry.clone(),
        Arc::new(HttpClientFactory::new()),
        config.gc_interval,
    )
    .with_hijacked_timeout(config.hijacked_container_timeout);
    let lifecycle = WorkerLifecycle::new(registry, config.lifecycle_interval)
        .with_heartbeat_ttl(config.worker_heartbeat_ttl);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector_rx = shutdown_rx.clone();
    let collector_task = tokio::spawn(async move { collector.run(collector_rx).await });
    let lifecycle_task = tokio::spawn(async move { lifecycle.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    collector_task.await?;
    lifecycle_task.await?;

    Ok(())
}
