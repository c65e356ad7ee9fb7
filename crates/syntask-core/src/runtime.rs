// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the syntask background services.
//!
//! [`ServicesRuntime`] wires the orchestration engine to a run store and starts
//! the background services the configuration enables:
//! - the late-run detector
//! - a lazily started run waiter (when an event subscriber is supplied)
//! - the API log worker (when a log sink is supplied)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use syntask_core::events::InMemoryEventBus;
//! use syntask_core::persistence::SqliteRunStore;
//! use syntask_core::runtime::ServicesRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteRunStore::from_url("sqlite:syntask.db?mode=rwc").await?);
//!     let bus = Arc::new(InMemoryEventBus::default());
//!
//!     let runtime = ServicesRuntime::builder()
//!         .store(store)
//!         .publisher(bus.clone())
//!         .subscriber(bus)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... propose transitions through runtime.engine() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::batching::BatchSink;
use crate::config::Config;
use crate::events::{EventPublisher, EventSubscriber};
use crate::late_runs::{LateRunsConfig, LateRunsService};
use crate::logs::{ApiLogWorker, LogRecord, LogShippingConfig};
use crate::orchestration::OrchestrationEngine;
use crate::persistence::RunStore;
use crate::waiter::{RunWaiterHandle, WaiterConfig};

/// How long shutdown waits for queued logs to be shipped.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for creating a [`ServicesRuntime`].
#[derive(Default)]
pub struct ServicesRuntimeBuilder {
    store: Option<Arc<dyn RunStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    subscriber: Option<Arc<dyn EventSubscriber>>,
    log_sink: Option<Arc<dyn BatchSink<LogRecord>>>,
    late_runs: LateRunsConfig,
    waiter: WaiterConfig,
    logging_to_api: LogShippingConfig,
}

impl std::fmt::Debug for ServicesRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicesRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("publisher", &self.publisher.is_some())
            .field("subscriber", &self.subscriber.is_some())
            .field("log_sink", &self.log_sink.is_some())
            .field("late_runs", &self.late_runs)
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl ServicesRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run store (required).
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish an event for every applied transition.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Event source for the run waiter. Without one, no waiter is available.
    pub fn subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Destination for shipped logs. Without one, no log worker is started.
    pub fn log_sink(mut self, sink: Arc<dyn BatchSink<LogRecord>>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Take every service setting from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.late_runs = config.late_runs.clone();
        self.waiter = config.waiter.clone();
        self.logging_to_api = config.logging_to_api.clone();
        self
    }

    /// Set the late-run detector settings.
    pub fn late_runs(mut self, config: LateRunsConfig) -> Self {
        self.late_runs = config;
        self
    }

    /// Set the run waiter settings.
    pub fn waiter(mut self, config: WaiterConfig) -> Self {
        self.waiter = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ServicesRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        let mut engine = OrchestrationEngine::new(store);
        if let Some(publisher) = self.publisher {
            engine = engine.with_events(publisher);
        }

        Ok(ServicesRuntimeConfig {
            engine,
            subscriber: self.subscriber,
            log_sink: self.log_sink,
            late_runs: self.late_runs,
            waiter: self.waiter,
            logging_to_api: self.logging_to_api,
        })
    }
}

/// Configuration for a [`ServicesRuntime`].
pub struct ServicesRuntimeConfig {
    engine: OrchestrationEngine,
    subscriber: Option<Arc<dyn EventSubscriber>>,
    log_sink: Option<Arc<dyn BatchSink<LogRecord>>>,
    late_runs: LateRunsConfig,
    waiter: WaiterConfig,
    logging_to_api: LogShippingConfig,
}

impl std::fmt::Debug for ServicesRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicesRuntimeConfig")
            .field("engine", &self.engine)
            .field("late_runs", &self.late_runs)
            .field("waiter", &self.waiter)
            .field("logging_to_api", &self.logging_to_api)
            .finish()
    }
}

impl ServicesRuntimeConfig {
    /// Start the enabled background services.
    pub async fn start(self) -> Result<ServicesRuntime> {
        let late_runs = if self.late_runs.enabled {
            let service = Arc::new(LateRunsService::new(
                self.engine.clone(),
                self.late_runs.clone(),
            ));
            let shutdown = service.shutdown_handle();
            let handle = tokio::spawn({
                let service = service.clone();
                async move { service.run().await }
            });
            Some(LateRunsTask {
                service,
                shutdown,
                handle,
            })
        } else {
            info!("Late runs service disabled");
            None
        };

        let waiter = self
            .subscriber
            .map(|subscriber| Arc::new(RunWaiterHandle::new(subscriber, self.waiter.clone())));

        let log_worker = self
            .log_sink
            .map(|sink| Arc::new(ApiLogWorker::start(sink, &self.logging_to_api)));

        info!(
            late_runs = late_runs.is_some(),
            waiter = waiter.is_some(),
            log_worker = log_worker.is_some(),
            "ServicesRuntime started"
        );

        Ok(ServicesRuntime {
            engine: self.engine,
            late_runs,
            waiter,
            log_worker,
        })
    }
}

struct LateRunsTask {
    service: Arc<LateRunsService>,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Running syntask background services.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServicesRuntime {
    engine: OrchestrationEngine,
    late_runs: Option<LateRunsTask>,
    waiter: Option<Arc<RunWaiterHandle>>,
    log_worker: Option<Arc<ApiLogWorker>>,
}

impl std::fmt::Debug for ServicesRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicesRuntime")
            .field("engine", &self.engine)
            .field("late_runs", &self.late_runs.is_some())
            .field("waiter", &self.waiter.is_some())
            .field("log_worker", &self.log_worker.is_some())
            .finish()
    }
}

impl ServicesRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ServicesRuntimeBuilder {
        ServicesRuntimeBuilder::new()
    }

    /// The orchestration engine all transitions go through.
    pub fn engine(&self) -> &OrchestrationEngine {
        &self.engine
    }

    /// The late-run detector, when enabled.
    pub fn late_runs(&self) -> Option<&Arc<LateRunsService>> {
        self.late_runs.as_ref().map(|task| &task.service)
    }

    /// The run waiter, when an event subscriber was configured.
    pub fn waiter(&self) -> Option<&Arc<RunWaiterHandle>> {
        self.waiter.as_ref()
    }

    /// The log worker, when a log sink was configured.
    pub fn log_worker(&self) -> Option<&Arc<ApiLogWorker>> {
        self.log_worker.as_ref()
    }

    /// Check if the late-run detector is still running.
    pub fn is_running(&self) -> bool {
        self.late_runs
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the late-run detector, releases the run waiter and ships any
    /// queued logs.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServicesRuntime shutting down...");

        if let Some(task) = self.late_runs {
            task.shutdown.notify_one();
            if let Err(e) = task.handle.await {
                error!("Late runs service task panicked: {}", e);
            }
        }

        if let Some(waiter) = &self.waiter {
            waiter.shutdown().await;
        }

        if let Some(worker) = &self.log_worker
            && let Err(e) = worker.drain(Some(LOG_DRAIN_TIMEOUT)).await
        {
            error!(error = %e, "Failed to ship queued logs during shutdown");
        }

        info!("ServicesRuntime shutdown complete");
        Ok(())
    }
}
