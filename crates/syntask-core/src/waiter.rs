// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waiting for runs to finish.
//!
//! [`RunWaiter`] consumes one event subscription filtered to terminal-state
//! events and wakes callers waiting on specific runs. Completions it has seen
//! are remembered in a bounded cache with a time-to-live, so a caller that
//! starts waiting just after the event arrived returns immediately.
//!
//! A completion that expired from the cache is no longer known to the waiter.
//! Waiting on such a run blocks until the timeout, since its event will not
//! be delivered again.
//!
//! The cache check, the registration and the second cache check all happen
//! under the registration lock, and the consumer records a completion and
//! takes the registration under the same lock. A completion is therefore
//! either seen by the caller's check or delivered to its registration.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{Event, EventError, EventFilter, EventStream, EventSubscriber};
use crate::states::RunKind;

/// Callback invoked once a run is observed finishing.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for a [`RunWaiter`].
#[derive(Debug, Clone)]
pub struct WaiterConfig {
    /// Kind of run whose completions are tracked.
    pub run_kind: RunKind,
    /// How long an observed completion is remembered.
    pub cache_ttl: Duration,
    /// Maximum number of remembered completions.
    pub cache_capacity: u64,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            run_kind: RunKind::TaskRun,
            cache_ttl: Duration::from_secs(600),
            cache_capacity: 10_000,
        }
    }
}

struct Registration {
    generation: u64,
    signal: watch::Sender<bool>,
    waiters: usize,
    callbacks: Vec<DoneCallback>,
}

struct Shared {
    observed: moka::sync::Cache<Uuid, ()>,
    registrations: Mutex<HashMap<Uuid, Registration>>,
    generations: AtomicU64,
    resource_prefix: &'static str,
}

impl Shared {
    fn registrations(&self) -> MutexGuard<'_, HashMap<Uuid, Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_id(&self, event: &Event) -> Result<Uuid, EventError> {
        let malformed = |reason: String| EventError::Malformed {
            event: event.event.clone(),
            reason,
        };

        let resource_id = event
            .resource
            .id()
            .ok_or_else(|| malformed("missing resource id".to_string()))?;
        let run_id = resource_id
            .strip_prefix(self.resource_prefix)
            .ok_or_else(|| malformed(format!("unexpected resource '{resource_id}'")))?;

        Uuid::parse_str(run_id).map_err(|e| malformed(e.to_string()))
    }

    fn observe(&self, run_id: Uuid) {
        let registration = {
            let mut registrations = self.registrations();
            self.observed.insert(run_id, ());
            registrations.remove(&run_id)
        };

        let Some(registration) = registration else {
            return;
        };

        registration.signal.send_replace(true);
        for callback in registration.callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!(run_id = %run_id, "Run completion callback panicked");
            }
        }
    }

    fn release(&self, run_id: Uuid, generation: u64) {
        let mut registrations = self.registrations();
        if let Some(registration) = registrations.get_mut(&run_id)
            && registration.generation == generation
        {
            registration.waiters = registration.waiters.saturating_sub(1);
            if registration.waiters == 0 && registration.callbacks.is_empty() {
                registrations.remove(&run_id);
            }
        }
    }
}

/// One waiter's hold on a registration, released on drop so a cancelled wait
/// does not leave it behind.
struct Registered {
    shared: Arc<Shared>,
    run_id: Uuid,
    generation: u64,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.shared.release(self.run_id, self.generation);
    }
}

/// Lets callers wait for runs to reach a terminal state.
pub struct RunWaiter {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RunWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWaiter")
            .field("observed", &self.shared.observed.entry_count())
            .field("registrations", &self.shared.registrations().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RunWaiter {
    /// Open the completion subscription and start consuming it.
    ///
    /// Fails if the subscription cannot be opened.
    pub async fn start(
        subscriber: Arc<dyn EventSubscriber>,
        config: WaiterConfig,
    ) -> Result<Self, EventError> {
        let filter = EventFilter::names(config.run_kind.terminal_event_names());
        let stream = subscriber.subscribe(filter).await?;

        let shared = Arc::new(Shared {
            observed: moka::sync::Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.cache_ttl)
                .build(),
            registrations: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            resource_prefix: config.run_kind.resource_prefix(),
        });
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(stream, shared.clone(), cancel.clone()));

        info!(
            run_kind = %config.run_kind,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            cache_capacity = config.cache_capacity,
            "Run waiter started"
        );

        Ok(Self {
            shared,
            cancel,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// Wait until the run's completion is observed or `timeout` elapses.
    ///
    /// Returns `true` if the completion was observed. A timeout is not an error.
    /// Returns `false` right away once the waiter is stopped.
    pub async fn wait_for_run(&self, run_id: Uuid, timeout: Option<Duration>) -> bool {
        let (_registered, mut signal) = {
            let mut registrations = self.shared.registrations();
            if self.shared.observed.contains_key(&run_id) {
                return true;
            }
            if self.cancel.is_cancelled() {
                return false;
            }

            let registration = registrations
                .entry(run_id)
                .or_insert_with(|| self.new_registration());
            registration.waiters += 1;
            let registered = Registered {
                shared: self.shared.clone(),
                run_id,
                generation: registration.generation,
            };
            let signal = registration.signal.subscribe();

            if self.shared.observed.contains_key(&run_id) {
                drop(registrations);
                return true;
            }

            (registered, signal)
        };

        let wait = signal.wait_for(|done| *done);
        let observed = match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_))),
            None => wait.await.is_ok(),
        };

        if !observed {
            debug!(run_id = %run_id, "Stopped waiting for run without observing completion");
        }
        observed
    }

    /// Call `callback` once the run's completion is observed.
    ///
    /// Runs `callback` immediately if the completion was already observed.
    /// Callbacks still pending when the waiter stops are dropped uncalled.
    pub fn add_done_callback<F>(&self, run_id: Uuid, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut registrations = self.shared.registrations();
            if !self.shared.observed.contains_key(&run_id) {
                registrations
                    .entry(run_id)
                    .or_insert_with(|| self.new_registration())
                    .callbacks
                    .push(Box::new(callback));
                return;
            }
        }

        callback();
    }

    /// Whether the run's completion was observed and is still remembered.
    pub fn has_observed(&self, run_id: Uuid) -> bool {
        self.shared.observed.contains_key(&run_id)
    }

    /// Whether the consumer task is still running.
    pub fn is_running(&self) -> bool {
        self.consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|consumer| !consumer.is_finished())
    }

    /// Stop consuming events and release every waiter.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(consumer) = consumer
            && let Err(e) = consumer.await
        {
            error!("Run waiter consumer task panicked: {}", e);
        }

        // Dropping the senders wakes every pending wait.
        let released = std::mem::take(&mut *self.shared.registrations());
        info!(registrations = released.len(), "Run waiter stopped");
    }

    fn new_registration(&self) -> Registration {
        let (signal, _) = watch::channel(false);
        Registration {
            generation: self.shared.generations.fetch_add(1, Ordering::Relaxed),
            signal,
            waiters: 0,
            callbacks: Vec::new(),
        }
    }
}

impl Drop for RunWaiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume(mut stream: EventStream, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => match shared.run_id(&event) {
                Ok(run_id) => {
                    debug!(run_id = %run_id, event = %event.event, "Observed run completion");
                    shared.observe(run_id);
                }
                Err(e) => warn!(error = %e, "Failed to handle run completion event"),
            },
            Some(Err(e)) => warn!(error = %e, "Error receiving run completion event"),
            None => {
                warn!("Run completion event stream ended");
                break;
            }
        }
    }
}

/// Shared, lazily started [`RunWaiter`].
///
/// The first use opens the subscription. After [`shutdown`](Self::shutdown),
/// or if the event stream ended, the next use starts a fresh waiter.
pub struct RunWaiterHandle {
    subscriber: Arc<dyn EventSubscriber>,
    config: WaiterConfig,
    current: tokio::sync::Mutex<Option<Arc<RunWaiter>>>,
}

impl std::fmt::Debug for RunWaiterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunWaiterHandle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunWaiterHandle {
    /// A handle that starts waiters on `subscriber` when first used.
    pub fn new(subscriber: Arc<dyn EventSubscriber>, config: WaiterConfig) -> Self {
        Self {
            subscriber,
            config,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// The running waiter, starting one if needed.
    pub async fn get(&self) -> Result<Arc<RunWaiter>, EventError> {
        let mut current = self.current.lock().await;
        if let Some(waiter) = current.as_ref()
            && waiter.is_running()
        {
            return Ok(waiter.clone());
        }

        let waiter = Arc::new(
            RunWaiter::start(self.subscriber.clone(), self.config.clone()).await?,
        );
        if let Some(stale) = current.replace(waiter.clone()) {
            stale.stop().await;
        }
        Ok(waiter)
    }

    /// See [`RunWaiter::wait_for_run`].
    pub async fn wait_for_run(
        &self,
        run_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<bool, EventError> {
        let waiter = self.get().await?;
        Ok(waiter.wait_for_run(run_id, timeout).await)
    }

    /// See [`RunWaiter::add_done_callback`].
    pub async fn add_done_callback<F>(&self, run_id: Uuid, callback: F) -> Result<(), EventError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.get().await?.add_done_callback(run_id, callback);
        Ok(())
    }

    /// Whether a waiter is currently running.
    pub async fn is_started(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|waiter| waiter.is_running())
    }

    /// Stop and release the current waiter, if any.
    pub async fn shutdown(&self) {
        let waiter = self.current.lock().await.take();
        if let Some(waiter) = waiter {
            waiter.stop().await;
        }
    }
}
