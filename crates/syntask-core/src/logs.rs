// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shipping run log records in batches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::batching::{BatchConfig, BatchError, BatchItem, BatchSink, BatchedQueue, DeliveryError};

/// Numeric log levels.
pub mod level {
    /// Debug.
    pub const DEBUG: i32 = 10;
    /// Info.
    pub const INFO: i32 = 20;
    /// Warning.
    pub const WARNING: i32 = 30;
    /// Error.
    pub const ERROR: i32 = 40;
    /// Critical.
    pub const CRITICAL: i32 = 50;
}

/// A log line emitted by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Logger name.
    pub name: String,
    /// Numeric level, see [`level`].
    pub level: i32,
    /// Formatted message.
    pub message: String,
    /// When the line was logged.
    pub timestamp: DateTime<Utc>,
    /// Flow run the line belongs to.
    pub flow_run_id: Option<Uuid>,
    /// Task run the line belongs to.
    pub task_run_id: Option<Uuid>,
}

impl LogRecord {
    /// A record logged now, not yet linked to a run.
    pub fn new(name: impl Into<String>, level: i32, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
            flow_run_id: None,
            task_run_id: None,
        }
    }

    /// Link to a flow run.
    pub fn for_flow_run(mut self, flow_run_id: Uuid) -> Self {
        self.flow_run_id = Some(flow_run_id);
        self
    }

    /// Link to a task run inside a flow run.
    pub fn for_task_run(mut self, flow_run_id: Uuid, task_run_id: Uuid) -> Self {
        self.flow_run_id = Some(flow_run_id);
        self.task_run_id = Some(task_run_id);
        self
    }
}

impl BatchItem for LogRecord {
    /// Length of the record's JSON encoding.
    fn payload_size(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |json| json.len())
    }
}

/// Settings for shipping logs.
#[derive(Debug, Clone)]
pub struct LogShippingConfig {
    /// Time between flushes.
    pub batch_interval: Duration,
    /// Target size of a request, in bytes.
    pub batch_size: usize,
    /// Largest accepted record, in bytes.
    pub max_log_size: usize,
    /// Maximum records per batch.
    pub max_batch_items: usize,
}

impl Default for LogShippingConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_secs(2),
            batch_size: 4_000_000,
            max_log_size: 1_000_000,
            max_batch_items: 1000,
        }
    }
}

impl LogShippingConfig {
    /// Queue limits for these settings.
    ///
    /// The byte budget leaves room for one maximal record, so a batch plus the
    /// record that triggers its flush stays within `batch_size`.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            name: "api-log-worker",
            max_batch_bytes: self
                .batch_size
                .saturating_sub(self.max_log_size)
                .max(self.max_log_size),
            max_item_bytes: self.max_log_size,
            max_batch_items: self.max_batch_items,
            flush_interval: self.batch_interval,
        }
    }
}

/// Background worker shipping [`LogRecord`]s in batches.
#[derive(Debug)]
pub struct ApiLogWorker {
    queue: BatchedQueue<LogRecord>,
}

impl ApiLogWorker {
    /// Start shipping to `sink`.
    pub fn start(sink: Arc<dyn BatchSink<LogRecord>>, config: &LogShippingConfig) -> Self {
        Self {
            queue: BatchedQueue::start(sink, config.batch_config()),
        }
    }

    /// Queue a record. Records over the size limit are refused.
    pub fn send(&self, record: LogRecord) -> Result<(), BatchError> {
        self.queue.send(record)
    }

    /// Ship everything queued so far.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<(), BatchError> {
        self.queue.flush(timeout).await
    }

    /// Ship everything queued so far and stop.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<(), BatchError> {
        self.queue.drain(timeout).await
    }

    /// Records queued but not yet shipped.
    pub fn pending_hint(&self) -> usize {
        self.queue.pending_hint()
    }
}

/// Stores shipped logs in the `logs` table.
#[derive(Debug, Clone)]
pub struct SqliteLogSink {
    pool: SqlitePool,
}

impl SqliteLogSink {
    /// Sink writing to an already-migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Logs of a flow run, oldest first.
    pub async fn logs_for_flow_run(
        &self,
        flow_run_id: Uuid,
    ) -> Result<Vec<LogRecord>, sqlx::Error> {
        let rows: Vec<(String, i32, String, DateTime<Utc>, Option<Uuid>, Option<Uuid>)> =
            sqlx::query_as(
                r#"
                SELECT name, level, message, timestamp, flow_run_id, task_run_id
                FROM logs
                WHERE flow_run_id = ?
                ORDER BY timestamp ASC, rowid ASC
                "#,
            )
            .bind(flow_run_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, level, message, timestamp, flow_run_id, task_run_id)| LogRecord {
                    name,
                    level,
                    message,
                    timestamp,
                    flow_run_id,
                    task_run_id,
                },
            )
            .collect())
    }

    async fn insert(&self, batch: &[LogRecord]) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"
                INSERT INTO logs (id, name, level, message, timestamp, flow_run_id, task_run_id,
                                  created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&record.name)
            .bind(record.level)
            .bind(&record.message)
            .bind(record.timestamp)
            .bind(record.flow_run_id)
            .bind(record.task_run_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }
}

#[async_trait]
impl BatchSink<LogRecord> for SqliteLogSink {
    async fn deliver(&self, batch: Vec<LogRecord>) -> Result<(), DeliveryError> {
        self.insert(&batch)
            .await
            .map_err(|e| DeliveryError::new(e.to_string()))
    }
}
