// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end run waiter tests.
//!
//! Transitions go through the orchestration engine, which publishes state
//! change events on the in-memory bus the waiter consumes.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;

use syntask_core::states::State;
use syntask_core::waiter::{RunWaiterHandle, WaiterConfig};

#[tokio::test]
async fn test_completed_task_run_wakes_waiter() {
    let ctx = TestContext::new().await;
    let run_id = ctx.task_run(State::pending()).await;
    let handle = Arc::new(RunWaiterHandle::new(ctx.bus.clone(), WaiterConfig::default()));
    handle.get().await.unwrap();

    let waiting = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .wait_for_run(run_id, Some(Duration::from_secs(5)))
                .await
        }
    });

    ctx.engine.propose(run_id, State::running()).await.unwrap();
    ctx.engine.propose(run_id, State::completed()).await.unwrap();

    assert!(waiting.await.unwrap().unwrap());
    handle.shutdown().await;
}

#[tokio::test]
async fn test_non_terminal_transitions_do_not_wake_waiter() {
    let ctx = TestContext::new().await;
    let run_id = ctx.task_run(State::pending()).await;
    let handle = RunWaiterHandle::new(ctx.bus.clone(), WaiterConfig::default());
    handle.get().await.unwrap();

    ctx.engine.propose(run_id, State::running()).await.unwrap();

    let observed = handle
        .wait_for_run(run_id, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(!observed);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_zero_timeout_after_completion_returns_true() {
    let ctx = TestContext::new().await;
    let run_id = ctx.task_run(State::running()).await;
    let handle = RunWaiterHandle::new(ctx.bus.clone(), WaiterConfig::default());
    let waiter = handle.get().await.unwrap();

    ctx.engine
        .propose(run_id, State::failed("boom"))
        .await
        .unwrap();

    let observer = waiter.clone();
    eventually(Duration::from_secs(5), move || {
        let observer = observer.clone();
        async move { observer.has_observed(run_id) }
    })
    .await;

    assert!(
        handle
            .wait_for_run(run_id, Some(Duration::ZERO))
            .await
            .unwrap()
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn test_done_callback_fires_on_crash() {
    let ctx = TestContext::new().await;
    let run_id = ctx.task_run(State::running()).await;
    let handle = RunWaiterHandle::new(ctx.bus.clone(), WaiterConfig::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handle
        .add_done_callback(run_id, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    ctx.engine
        .propose(run_id, State::crashed("worker lost"))
        .await
        .unwrap();

    let seen = calls.clone();
    eventually(Duration::from_secs(5), move || {
        let seen = seen.clone();
        async move { seen.load(Ordering::SeqCst) == 1 }
    })
    .await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_many_waiters_on_one_run() {
    let ctx = TestContext::new().await;
    let run_id = ctx.task_run(State::running()).await;
    let handle = Arc::new(RunWaiterHandle::new(ctx.bus.clone(), WaiterConfig::default()));
    handle.get().await.unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .wait_for_run(run_id, Some(Duration::from_secs(5)))
                    .await
            })
        })
        .collect();

    ctx.engine.propose(run_id, State::cancelled()).await.unwrap();

    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap());
    }
    handle.shutdown().await;
}
