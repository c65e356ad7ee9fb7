// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded batching queue with timed flushes.
//!
//! [`BatchedQueue`] buffers items in a background task and hands them to a
//! [`BatchSink`] in batches. A batch is delivered when adding the next item
//! would push it over the byte budget, when it reaches the item cap, or when
//! the flush interval has passed since the last delivery.
//!
//! Delivery is best effort. A batch the sink fails to accept is logged and
//! dropped; retrying would let a failing sink grow the buffer without bound.
//! Items larger than the per-item limit are refused by [`BatchedQueue::send`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Errors from [`BatchedQueue`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// The item is larger than the per-item limit and was not queued.
    #[error("Item of {size} bytes exceeds the maximum of {max} bytes")]
    OversizedItem {
        /// Size of the rejected item.
        size: usize,
        /// Configured per-item limit.
        max: usize,
    },

    /// The queue has been drained and accepts no more items.
    #[error("Batched queue is closed")]
    Closed,

    /// The flush or drain did not finish in time.
    #[error("Timed out waiting for pending items to be delivered")]
    DrainTimeout,
}

/// A sink refused or failed to accept a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery failed: {0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    /// A delivery error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// An item that can be batched.
pub trait BatchItem: Send + 'static {
    /// Size in bytes the item contributes to a batch.
    fn payload_size(&self) -> usize;
}

impl BatchItem for String {
    fn payload_size(&self) -> usize {
        self.len()
    }
}

impl BatchItem for Vec<u8> {
    fn payload_size(&self) -> usize {
        self.len()
    }
}

/// Destination of delivered batches.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    /// Deliver one batch.
    async fn deliver(&self, batch: Vec<T>) -> Result<(), DeliveryError>;
}

/// Limits of a [`BatchedQueue`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Name used in logs.
    pub name: &'static str,
    /// Byte budget of a single batch.
    pub max_batch_bytes: usize,
    /// Largest accepted item, in bytes.
    pub max_item_bytes: usize,
    /// Maximum items per batch.
    pub max_batch_items: usize,
    /// Longest time items wait before being delivered.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batched-queue",
            max_batch_bytes: 3_000_000,
            max_item_bytes: 1_000_000,
            max_batch_items: 1000,
            flush_interval: Duration::from_secs(2),
        }
    }
}

enum Command<T> {
    Item(T, usize),
    Flush(oneshot::Sender<()>),
    Drain,
}

/// Background batching queue for items of type `T`.
pub struct BatchedQueue<T: BatchItem> {
    sender: mpsc::UnboundedSender<Command<T>>,
    config: BatchConfig,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: BatchItem> std::fmt::Debug for BatchedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedQueue")
            .field("config", &self.config)
            .field("pending", &self.pending_hint())
            .finish()
    }
}

impl<T: BatchItem> BatchedQueue<T> {
    /// Spawn the batching task delivering to `sink`.
    pub fn start(sink: Arc<dyn BatchSink<T>>, config: BatchConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        info!(
            queue = config.name,
            max_batch_bytes = config.max_batch_bytes,
            max_item_bytes = config.max_item_bytes,
            max_batch_items = config.max_batch_items,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Batched queue started"
        );

        let worker = Worker {
            sink,
            config: config.clone(),
            pending: pending.clone(),
            batch: Vec::new(),
            batch_bytes: 0,
        };
        let handle = tokio::spawn(worker.run(receiver));

        Self {
            sender,
            config,
            pending,
            closed: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Queue an item. Never waits.
    pub fn send(&self, item: T) -> Result<(), BatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BatchError::Closed);
        }

        let size = item.payload_size();
        if size > self.config.max_item_bytes {
            return Err(BatchError::OversizedItem {
                size,
                max: self.config.max_item_bytes,
            });
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(Command::Item(item, size))
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                BatchError::Closed
            })
    }

    /// Deliver everything queued so far and keep running.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<(), BatchError> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(Command::Flush(ack))
            .map_err(|_| BatchError::Closed)?;

        wait(done, timeout).await
    }

    /// Deliver everything queued so far, then stop the queue.
    ///
    /// Items sent once draining has begun are refused with
    /// [`BatchError::Closed`]. Later calls return immediately. After a
    /// timeout the queue keeps stopping in the background, and calling
    /// `drain` again waits for it to finish.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<(), BatchError> {
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.as_mut() else {
            return Ok(());
        };

        if !self.closed.swap(true, Ordering::SeqCst) {
            // Fails only if the worker already stopped; joining covers that.
            let _ = self.sender.send(Command::Drain);
        }

        let joined = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut *handle)
                .await
                .map_err(|_| BatchError::DrainTimeout)?,
            None => handle.await,
        };
        if let Err(e) = joined {
            error!(queue = self.config.name, "Batched queue task panicked: {}", e);
        }
        *worker = None;

        info!(queue = self.config.name, "Batched queue drained");
        Ok(())
    }

    /// Items sent but not yet handed to the sink.
    pub fn pending_hint(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// The queue's limits.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

async fn wait(done: oneshot::Receiver<()>, timeout: Option<Duration>) -> Result<(), BatchError> {
    let result = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, done)
            .await
            .map_err(|_| BatchError::DrainTimeout)?,
        None => done.await,
    };
    result.map_err(|_| BatchError::Closed)
}

struct Worker<T> {
    sink: Arc<dyn BatchSink<T>>,
    config: BatchConfig,
    pending: Arc<AtomicUsize>,
    batch: Vec<T>,
    batch_bytes: usize,
}

impl<T: BatchItem> Worker<T> {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command<T>>) {
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(Command::Item(item, size)) => {
                        if self.add(item, size).await {
                            ticker.reset();
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush().await;
                        ticker.reset();
                        let _ = ack.send(());
                    }
                    Some(Command::Drain) => {
                        self.finish(&mut receiver).await;
                        break;
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        debug!(queue = self.config.name, "Batched queue task stopped");
    }

    /// Add an item, flushing around it as the budgets require. Returns
    /// whether anything was delivered.
    async fn add(&mut self, item: T, size: usize) -> bool {
        let mut flushed = false;
        if !self.batch.is_empty() && self.batch_bytes + size > self.config.max_batch_bytes {
            self.flush().await;
            flushed = true;
        }

        self.batch.push(item);
        self.batch_bytes += size;

        if self.batch.len() >= self.config.max_batch_items {
            self.flush().await;
            flushed = true;
        }
        flushed
    }

    /// Stop accepting commands and deliver everything already queued.
    async fn finish(&mut self, receiver: &mut mpsc::UnboundedReceiver<Command<T>>) {
        receiver.close();

        let mut acks = Vec::new();
        while let Ok(command) = receiver.try_recv() {
            match command {
                Command::Item(item, size) => {
                    self.add(item, size).await;
                }
                Command::Flush(ack) => acks.push(ack),
                Command::Drain => {}
            }
        }
        self.flush().await;

        for ack in acks {
            let _ = ack.send(());
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let count = batch.len();
        let bytes = std::mem::replace(&mut self.batch_bytes, 0);

        match self.sink.deliver(batch).await {
            Ok(()) => debug!(queue = self.config.name, count, bytes, "Delivered batch"),
            Err(e) => warn!(
                queue = self.config.name,
                count,
                bytes,
                error = %e,
                "Failed to deliver batch, dropping it"
            ),
        }

        self.pending.fetch_sub(count, Ordering::Relaxed);
    }
}
