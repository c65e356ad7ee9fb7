// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syntask services - background run-state services
//!
//! Runs the late-run detector and the log worker against the SQLite run store,
//! with an in-process event bus feeding the run waiter.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use syntask_core::config::Config;
use syntask_core::events::InMemoryEventBus;
use syntask_core::logs::SqliteLogSink;
use syntask_core::persistence::{RunStore, SqliteRunStore};
use syntask_core::runtime::ServicesRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("syntask_core=info".parse()?),
        )
        .init();

    info!("Starting Syntask services");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        late_runs_enabled = config.late_runs.enabled,
        late_runs_loop_secs = config.late_runs.loop_interval.as_secs(),
        late_runs_after_secs = config.late_runs.late_after.as_secs(),
        late_runs_batch_size = config.late_runs.batch_size,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store = Arc::new(SqliteRunStore::from_url(&config.database_url).await?);
    if !store.health_check().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database connection established");

    let bus = Arc::new(InMemoryEventBus::default());
    let log_sink = Arc::new(SqliteLogSink::new(store.pool().clone()));

    let runtime = ServicesRuntime::builder()
        .store(store.clone())
        .publisher(bus.clone())
        .subscriber(bus)
        .log_sink(log_sink)
        .config(&config)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    store.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
