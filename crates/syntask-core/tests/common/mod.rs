// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for syntask-core integration tests.
//!
//! Provides TestContext with an in-memory run store, an event bus, and an
//! orchestration engine publishing to it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use syntask_core::events::InMemoryEventBus;
use syntask_core::orchestration::OrchestrationEngine;
use syntask_core::persistence::{NewRun, RunRecord, RunStore, SqliteRunStore};
use syntask_core::states::State;

/// Test context wiring a store, an event bus and an engine together.
pub struct TestContext {
    pub sqlite: Arc<SqliteRunStore>,
    pub store: Arc<dyn RunStore>,
    pub bus: Arc<InMemoryEventBus>,
    pub engine: OrchestrationEngine,
}

impl TestContext {
    /// Create a new test context backed by a private in-memory database.
    pub async fn new() -> Self {
        let sqlite = Arc::new(
            SqliteRunStore::in_memory()
                .await
                .expect("Failed to create in-memory store"),
        );
        let store: Arc<dyn RunStore> = sqlite.clone();
        let bus = Arc::new(InMemoryEventBus::new(256));
        let engine = OrchestrationEngine::new(store.clone()).with_events(bus.clone());

        Self {
            sqlite,
            store,
            bus,
            engine,
        }
    }

    /// Create a flow run scheduled at `at`.
    pub async fn scheduled_flow_run(&self, at: DateTime<Utc>) -> Uuid {
        self.store
            .create_run(NewRun::flow_run(
                Uuid::new_v4(),
                "scheduled-flow",
                State::scheduled(at),
            ))
            .await
            .expect("Failed to create flow run")
            .id
    }

    /// Create a task run in `state`.
    pub async fn task_run(&self, state: State) -> Uuid {
        self.store
            .create_run(NewRun::task_run(Uuid::new_v4(), "task", state))
            .await
            .expect("Failed to create task run")
            .id
    }

    /// Read a run, panicking if it does not exist.
    pub async fn run(&self, run_id: Uuid) -> RunRecord {
        self.store
            .get_run(run_id)
            .await
            .expect("Failed to read run")
            .expect("Run should exist")
    }
}

/// Poll `check` until it returns true, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not met before timeout");
}
