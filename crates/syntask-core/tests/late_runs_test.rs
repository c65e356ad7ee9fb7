// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Late run detection tests.
//!
//! Drives `LateRunsService` through its public API against a real SQLite
//! store, plus wrapper stores that report runs which no longer exist or lose
//! their state writes to a concurrent writer.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use uuid::Uuid;

use syntask_core::OrchestrationError;
use syntask_core::late_runs::{LateRunsConfig, LateRunsService};
use syntask_core::orchestration::OrchestrationEngine;
use syntask_core::persistence::{LateRunCandidate, LateRunQuery, NewRun, RunRecord, RunStore};
use syntask_core::states::{LATE_STATE_NAME, State, StateType};

fn config(batch_size: usize) -> LateRunsConfig {
    LateRunsConfig {
        enabled: true,
        loop_interval: Duration::from_millis(10),
        late_after: Duration::from_secs(15),
        batch_size,
    }
}

#[tokio::test]
async fn test_overdue_run_is_marked_late_with_original_time() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let scheduled_at = now - ChronoDuration::seconds(60);
    let run_id = ctx.scheduled_flow_run(scheduled_at).await;

    let service = LateRunsService::new(ctx.engine.clone(), config(10));
    let report = service.run_once_at(now).await.unwrap();

    assert_eq!(report.marked, 1);
    let run = ctx.run(run_id).await;
    assert_eq!(run.state.state_type, StateType::Scheduled);
    assert_eq!(run.state.name, LATE_STATE_NAME);
    assert_eq!(run.state.details.scheduled_time, Some(scheduled_at));
    assert_eq!(run.next_scheduled_start_time, Some(scheduled_at));
}

#[tokio::test]
async fn test_run_inside_grace_period_is_left_alone() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let run_id = ctx
        .scheduled_flow_run(now - ChronoDuration::seconds(5))
        .await;

    let service = LateRunsService::new(ctx.engine.clone(), config(10));
    let report = service.run_once_at(now).await.unwrap();

    assert_eq!(report.marked, 0);
    assert!(ctx.run(run_id).await.state.is_plain_scheduled());
}

#[tokio::test]
async fn test_late_run_can_still_start() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let run_id = ctx
        .scheduled_flow_run(now - ChronoDuration::seconds(60))
        .await;

    let service = LateRunsService::new(ctx.engine.clone(), config(10));
    service.run_once_at(now).await.unwrap();

    let applied = ctx.engine.propose(run_id, State::pending()).await.unwrap();
    assert!(applied.previous.is_late());
    assert_eq!(applied.state.state_type, StateType::Pending);

    let history = ctx.store.state_history(run_id).await.unwrap();
    let names: Vec<_> = history.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Scheduled", "Late", "Pending"]);
}

#[tokio::test]
async fn test_task_runs_are_not_swept() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let run_id = ctx
        .task_run(State::scheduled(now - ChronoDuration::seconds(60)))
        .await;

    let service = LateRunsService::new(ctx.engine.clone(), config(10));
    let report = service.run_once_at(now).await.unwrap();

    assert_eq!(report.marked, 0);
    assert!(ctx.run(run_id).await.state.is_plain_scheduled());
}

#[tokio::test]
async fn test_sweep_covers_more_runs_than_one_batch() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            ctx.scheduled_flow_run(now - ChronoDuration::seconds(100 + i))
                .await,
        );
    }

    let service = LateRunsService::new(ctx.engine.clone(), config(2));
    let report = service.run_once_at(now).await.unwrap();

    assert_eq!(report.marked, 5);
    assert_eq!(report.batches, 3);
    for id in ids {
        assert!(ctx.run(id).await.state.is_late());
    }
}

#[tokio::test]
async fn test_background_loop_marks_runs() {
    let ctx = TestContext::new().await;
    let run_id = ctx
        .scheduled_flow_run(Utc::now() - ChronoDuration::seconds(60))
        .await;

    let service = Arc::new(LateRunsService::new(ctx.engine.clone(), config(10)));
    let shutdown = service.shutdown_handle();
    let handle = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });

    let store = ctx.store.clone();
    eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get_run(run_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|run| run.state.is_late())
        }
    })
    .await;

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("Service should stop")
        .unwrap();
}

/// Store that answers late-run queries with runs it does not have.
struct PhantomStore {
    inner: Arc<dyn RunStore>,
    queries: AtomicUsize,
}

#[async_trait]
impl RunStore for PhantomStore {
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, OrchestrationError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, OrchestrationError> {
        self.inner.get_run(run_id).await
    }

    async fn write_state(
        &self,
        run_id: Uuid,
        state: &State,
        expected_state_id: Uuid,
    ) -> Result<RunRecord, OrchestrationError> {
        self.inner.write_state(run_id, state, expected_state_id).await
    }

    async fn query_late_runs(
        &self,
        query: &LateRunQuery,
    ) -> Result<Vec<LateRunCandidate>, OrchestrationError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok((0..query.limit)
            .map(|_| LateRunCandidate {
                run_id: Uuid::new_v4(),
                next_scheduled_start_time: query.scheduled_before,
            })
            .collect())
    }

    async fn state_history(&self, run_id: Uuid) -> Result<Vec<State>, OrchestrationError> {
        self.inner.state_history(run_id).await
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, OrchestrationError> {
        self.inner.delete_run(run_id).await
    }

    async fn health_check(&self) -> Result<bool, OrchestrationError> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_full_batch_without_progress_ends_sweep() {
    let ctx = TestContext::new().await;
    let phantom = Arc::new(PhantomStore {
        inner: ctx.store.clone(),
        queries: AtomicUsize::new(0),
    });
    let engine = OrchestrationEngine::new(phantom.clone());

    let service = LateRunsService::new(engine, config(3));
    let report = service.run_once_at(Utc::now()).await.unwrap();

    assert_eq!(report.marked, 0);
    assert_eq!(report.skipped, 3);
    assert_eq!(report.batches, 1);
    assert_eq!(phantom.queries.load(Ordering::SeqCst), 1);
}

/// Store whose state writes for one run always lose to a concurrent writer.
struct ConflictingStore {
    inner: Arc<dyn RunStore>,
    contested: Uuid,
}

#[async_trait]
impl RunStore for ConflictingStore {
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, OrchestrationError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, OrchestrationError> {
        self.inner.get_run(run_id).await
    }

    async fn write_state(
        &self,
        run_id: Uuid,
        state: &State,
        expected_state_id: Uuid,
    ) -> Result<RunRecord, OrchestrationError> {
        if run_id == self.contested {
            return Err(OrchestrationError::ConcurrencyConflict { run_id });
        }
        self.inner.write_state(run_id, state, expected_state_id).await
    }

    async fn query_late_runs(
        &self,
        query: &LateRunQuery,
    ) -> Result<Vec<LateRunCandidate>, OrchestrationError> {
        self.inner.query_late_runs(query).await
    }

    async fn state_history(&self, run_id: Uuid) -> Result<Vec<State>, OrchestrationError> {
        self.inner.state_history(run_id).await
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, OrchestrationError> {
        self.inner.delete_run(run_id).await
    }

    async fn health_check(&self) -> Result<bool, OrchestrationError> {
        self.inner.health_check().await
    }
}

#[tokio::test]
async fn test_concurrent_write_is_skipped_and_sweep_continues() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let first = ctx
        .scheduled_flow_run(now - ChronoDuration::seconds(90))
        .await;
    let contested = ctx
        .scheduled_flow_run(now - ChronoDuration::seconds(80))
        .await;
    let last = ctx
        .scheduled_flow_run(now - ChronoDuration::seconds(70))
        .await;

    let store = Arc::new(ConflictingStore {
        inner: ctx.store.clone(),
        contested,
    });
    let service = LateRunsService::new(OrchestrationEngine::new(store), config(10));
    let report = service.run_once_at(now).await.unwrap();

    assert_eq!(report.marked, 2);
    assert_eq!(report.skipped, 1);
    assert!(ctx.run(first).await.state.is_late());
    assert!(ctx.run(contested).await.state.is_plain_scheduled());
    assert!(ctx.run(last).await.state.is_late());
}
