// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background service that marks overdue scheduled runs as `Late`.
//!
//! Flow runs still in the plain `Scheduled` state more than `late_after` past
//! their scheduled start time are moved to the `Late` sub-state through the
//! orchestration engine. The state type stays `SCHEDULED`, so a late run can
//! still be picked up normally.
//!
//! Each sweep computes its cutoff once, then fetches and corrects batches
//! (oldest first) until a fetch comes back short. Marked runs drop out of the
//! query, so repeated sweeps never correct a run twice. Runs that were deleted,
//! started, or changed by another writer in the meantime are skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestrationError, Result};
use crate::orchestration::{OrchestrationEngine, Policy};
use crate::persistence::{LateRunCandidate, LateRunQuery, RunStore};
use crate::states::{RunKind, State};

/// Configuration for the late-runs service.
#[derive(Debug, Clone)]
pub struct LateRunsConfig {
    /// Whether the runtime starts the service.
    pub enabled: bool,
    /// Time between sweeps.
    pub loop_interval: Duration,
    /// How far past its scheduled start a run must be to count as late.
    pub late_after: Duration,
    /// Maximum runs fetched and corrected per batch.
    pub batch_size: usize,
}

impl Default for LateRunsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loop_interval: Duration::from_secs(5),
            late_after: Duration::from_secs(15),
            batch_size: 400,
        }
    }
}

/// What the service is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    /// Not running.
    Idle,
    /// Fetching a batch of overdue runs.
    Scanning,
    /// Marking the fetched batch late.
    Correcting,
    /// Waiting for the next sweep.
    Sleeping,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Number of fetches issued.
    pub batches: usize,
    /// Runs moved to `Late`.
    pub marked: usize,
    /// Runs that could not be marked.
    pub skipped: usize,
}

/// Background worker that marks overdue runs as late.
pub struct LateRunsService {
    engine: OrchestrationEngine,
    policy: Policy,
    config: LateRunsConfig,
    shutdown: Arc<Notify>,
    phase: watch::Sender<DetectorPhase>,
    sweep: Mutex<()>,
}

impl std::fmt::Debug for LateRunsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LateRunsService")
            .field("config", &self.config)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl LateRunsService {
    /// Create a new service driving transitions through `engine`.
    pub fn new(engine: OrchestrationEngine, config: LateRunsConfig) -> Self {
        let (phase, _) = watch::channel(DetectorPhase::Idle);
        Self {
            engine,
            policy: Policy::mark_late_runs(),
            config,
            shutdown: Arc::new(Notify::new()),
            phase,
            sweep: Mutex::new(()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Signal with `notify_one` so a shutdown requested mid-sweep is not lost.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Watch the service's phase.
    pub fn phase(&self) -> watch::Receiver<DetectorPhase> {
        self.phase.subscribe()
    }

    /// The service's configuration.
    pub fn config(&self) -> &LateRunsConfig {
        &self.config
    }

    /// Run sweeps every `loop_interval` until shutdown is signalled.
    ///
    /// The first sweep starts immediately. A failed sweep is logged and retried
    /// on the next tick.
    pub async fn run(&self) {
        info!(
            loop_interval_secs = self.config.loop_interval.as_secs_f64(),
            late_after_secs = self.config.late_after.as_secs(),
            batch_size = self.config.batch_size,
            "Late runs service started"
        );

        // interval() panics on a zero period.
        let period = self.config.loop_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.phase.send_replace(DetectorPhase::Sleeping);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Late runs service received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to mark late runs");
                    }
                }
            }
        }

        self.phase.send_replace(DetectorPhase::Idle);
        info!("Late runs service stopped");
    }

    /// Perform one sweep now.
    pub async fn run_once(&self) -> Result<SweepReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Perform one sweep, treating `now` as the current time.
    ///
    /// Sweeps on the same service never overlap; a concurrent call waits for
    /// the running sweep to finish first.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let _sweep = self.sweep.lock().await;

        let late_after = chrono::Duration::from_std(self.config.late_after).map_err(|e| {
            OrchestrationError::Validation {
                field: "late_after".to_string(),
                message: e.to_string(),
            }
        })?;
        let cutoff = now - late_after;
        let batch_size = self.config.batch_size.max(1);
        let query = LateRunQuery {
            kind: RunKind::FlowRun,
            scheduled_before: cutoff,
            limit: batch_size as i64,
        };

        let mut report = SweepReport::default();
        let result = self.sweep_batches(&query, batch_size, now, &mut report).await;
        self.phase.send_replace(DetectorPhase::Sleeping);
        result?;

        if report.marked > 0 || report.skipped > 0 {
            info!(
                marked = report.marked,
                skipped = report.skipped,
                batches = report.batches,
                cutoff = %cutoff,
                "Finished late runs sweep"
            );
        } else {
            debug!(cutoff = %cutoff, "No late runs found");
        }

        Ok(report)
    }

    async fn sweep_batches(
        &self,
        query: &LateRunQuery,
        batch_size: usize,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        loop {
            self.phase.send_replace(DetectorPhase::Scanning);
            let batch = self.store().query_late_runs(query).await?;
            report.batches += 1;

            let fetched = batch.len();
            if fetched == 0 {
                return Ok(());
            }

            self.phase.send_replace(DetectorPhase::Correcting);
            let mut marked = 0;
            for candidate in batch {
                if self.mark_late(&candidate, now).await {
                    marked += 1;
                } else {
                    report.skipped += 1;
                }
            }
            report.marked += marked;

            if fetched < batch_size {
                return Ok(());
            }

            if marked == 0 {
                warn!(
                    batch_size,
                    "No run in a full batch could be marked late, ending sweep early"
                );
                return Ok(());
            }
        }
    }

    /// Propose `Late` for one run. Returns whether the run was marked.
    async fn mark_late(&self, candidate: &LateRunCandidate, now: DateTime<Utc>) -> bool {
        let run_id = candidate.run_id;
        let state = State::late(candidate.next_scheduled_start_time);

        match self
            .engine
            .propose_transition_at(run_id, state, &self.policy, now)
            .await
        {
            Ok(applied) => {
                debug!(
                    run_id = %run_id,
                    scheduled_time = %candidate.next_scheduled_start_time,
                    state_id = %applied.state.id,
                    "Marked run as late"
                );
                true
            }
            Err(e) if e.is_skippable_for_background() => {
                debug!(
                    run_id = %run_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Skipped late run that changed since it was fetched"
                );
                false
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to mark run as late");
                false
            }
        }
    }

    fn store(&self) -> &Arc<dyn RunStore> {
        self.engine.store()
    }
}
