// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Services runtime and log shipping tests.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use uuid::Uuid;

use syntask_core::batching::{BatchError, BatchItem, BatchSink, DeliveryError};
use syntask_core::late_runs::LateRunsConfig;
use syntask_core::logs::{ApiLogWorker, LogRecord, LogShippingConfig, SqliteLogSink, level};
use syntask_core::persistence::RunStore;
use syntask_core::runtime::ServicesRuntime;
use syntask_core::states::State;

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<LogRecord>>>,
}

impl RecordingSink {
    fn batches(&self) -> Vec<Vec<LogRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSink<LogRecord> for RecordingSink {
    async fn deliver(&self, batch: Vec<LogRecord>) -> Result<(), DeliveryError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

fn record(message: &str) -> LogRecord {
    LogRecord::new("syntask.flow_runs", level::INFO, message)
}

#[tokio::test]
async fn test_batches_respect_request_size() {
    let sink = Arc::new(RecordingSink::default());
    let config = LogShippingConfig {
        batch_interval: Duration::from_secs(60),
        batch_size: 2_000,
        max_log_size: 500,
        max_batch_items: 1000,
    };
    let worker = ApiLogWorker::start(sink.clone(), &config);

    let message = "x".repeat(200);
    for _ in 0..40 {
        worker.send(record(&message)).unwrap();
    }
    worker.drain(Some(Duration::from_secs(5))).await.unwrap();

    let batches = sink.batches();
    assert!(batches.len() > 1);
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 40);
    for batch in &batches {
        let bytes: usize = batch.iter().map(BatchItem::payload_size).sum();
        assert!(bytes <= config.batch_size, "batch of {bytes} bytes");
    }
}

#[tokio::test]
async fn test_oversized_record_is_refused() {
    let sink = Arc::new(RecordingSink::default());
    let config = LogShippingConfig {
        max_log_size: 300,
        batch_size: 1_000,
        ..Default::default()
    };
    let worker = ApiLogWorker::start(sink.clone(), &config);

    let err = worker.send(record(&"y".repeat(500))).unwrap_err();
    assert!(matches!(err, BatchError::OversizedItem { max: 300, .. }));

    worker.send(record("fits")).unwrap();
    worker.drain(None).await.unwrap();

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].message, "fits");
}

#[tokio::test]
async fn test_logs_land_in_sqlite() {
    let ctx = TestContext::new().await;
    let sink = Arc::new(SqliteLogSink::new(ctx.sqlite.pool().clone()));
    let worker = ApiLogWorker::start(sink.clone(), &LogShippingConfig::default());

    let flow_run_id = Uuid::new_v4();
    let task_run_id = Uuid::new_v4();
    worker
        .send(record("flow started").for_flow_run(flow_run_id))
        .unwrap();
    worker
        .send(
            LogRecord::new("syntask.task_runs", level::ERROR, "task failed")
                .for_task_run(flow_run_id, task_run_id),
        )
        .unwrap();
    worker.send(record("unrelated")).unwrap();
    worker.flush(Some(Duration::from_secs(5))).await.unwrap();

    let logs = sink.logs_for_flow_run(flow_run_id).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].message, "flow started");
    assert_eq!(logs[1].level, level::ERROR);
    assert_eq!(logs[1].task_run_id, Some(task_run_id));

    worker.drain(None).await.unwrap();
}

#[tokio::test]
async fn test_runtime_end_to_end() {
    let ctx = TestContext::new().await;
    let sink = Arc::new(RecordingSink::default());

    let runtime = ServicesRuntime::builder()
        .store(ctx.store.clone())
        .publisher(ctx.bus.clone())
        .subscriber(ctx.bus.clone())
        .log_sink(sink.clone())
        .late_runs(LateRunsConfig {
            loop_interval: Duration::from_millis(10),
            ..Default::default()
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let late_id = ctx
        .scheduled_flow_run(Utc::now() - ChronoDuration::seconds(60))
        .await;
    let store = ctx.store.clone();
    eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .get_run(late_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|run| run.state.is_late())
        }
    })
    .await;

    let task_id = ctx.task_run(State::running()).await;
    let waiter = runtime.waiter().unwrap().clone();
    waiter.get().await.unwrap();
    runtime
        .engine()
        .propose(task_id, State::completed())
        .await
        .unwrap();
    assert!(
        waiter
            .wait_for_run(task_id, Some(Duration::from_secs(5)))
            .await
            .unwrap()
    );

    runtime
        .log_worker()
        .unwrap()
        .send(record("shutting down"))
        .unwrap();
    runtime.shutdown().await.unwrap();

    let batches = sink.batches();
    assert_eq!(batches.concat().len(), 1);
    assert!(!waiter.is_started().await);
}
