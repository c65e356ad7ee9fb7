// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run store interface and backends.
//!
//! The orchestration engine is the only writer of run states. It reads the
//! current state, validates the proposal, then calls [`RunStore::write_state`]
//! with the id of the state it validated against. Backends must apply the write
//! atomically and refuse it when the run's current state id no longer matches.

pub mod sqlite;

pub use self::sqlite::SqliteRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::states::{RunKind, State};

/// A run as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Unique identifier of the run.
    pub id: Uuid,
    /// Flow or task run.
    pub kind: RunKind,
    /// Owning flow definition.
    pub flow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// When a scheduled run is expected to start; follows the scheduled time of
    /// the current `SCHEDULED` state.
    pub next_scheduled_start_time: Option<DateTime<Utc>>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run was last modified.
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Id to use; a random id is generated when `None`.
    pub id: Option<Uuid>,
    /// Flow or task run.
    pub kind: RunKind,
    /// Owning flow definition.
    pub flow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Initial state.
    pub state: State,
}

impl NewRun {
    /// A flow run starting in `state`.
    pub fn flow_run(flow_id: Uuid, name: impl Into<String>, state: State) -> Self {
        Self {
            id: None,
            kind: RunKind::FlowRun,
            flow_id,
            name: name.into(),
            state,
        }
    }

    /// A task run starting in `state`.
    pub fn task_run(flow_id: Uuid, name: impl Into<String>, state: State) -> Self {
        Self {
            kind: RunKind::TaskRun,
            ..Self::flow_run(flow_id, name, state)
        }
    }

    /// Use a fixed id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// Query for runs that are overdue to start.
///
/// Matches runs of `kind` in (`SCHEDULED`, `"Scheduled"`) whose next scheduled
/// start time is at or before `scheduled_before`, oldest first.
#[derive(Debug, Clone)]
pub struct LateRunQuery {
    /// Kind of run to look at.
    pub kind: RunKind,
    /// Inclusive upper bound on the scheduled start time.
    pub scheduled_before: DateTime<Utc>,
    /// Maximum number of runs to return.
    pub limit: i64,
}

/// An overdue run returned by [`RunStore::query_late_runs`].
#[derive(Debug, Clone, PartialEq)]
pub struct LateRunCandidate {
    /// The run.
    pub run_id: Uuid,
    /// Its scheduled start time.
    pub next_scheduled_start_time: DateTime<Utc>,
}

/// Persistence interface for runs and their states.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in its initial state.
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, OrchestrationError>;

    /// Read a run.
    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, OrchestrationError>;

    /// Replace the run's current state with `state` and append it to the history.
    ///
    /// The write only applies while the run's current state id equals
    /// `expected_state_id`; otherwise it fails with
    /// [`OrchestrationError::ConcurrencyConflict`], or
    /// [`OrchestrationError::RunNotFound`] when the run no longer exists.
    async fn write_state(
        &self,
        run_id: Uuid,
        state: &State,
        expected_state_id: Uuid,
    ) -> Result<RunRecord, OrchestrationError>;

    /// Runs overdue to start, oldest first.
    async fn query_late_runs(
        &self,
        query: &LateRunQuery,
    ) -> Result<Vec<LateRunCandidate>, OrchestrationError>;

    /// All states the run has been in, oldest first.
    async fn state_history(&self, run_id: Uuid) -> Result<Vec<State>, OrchestrationError>;

    /// Delete a run. Administrative; never called by the orchestration core.
    async fn delete_run(&self, run_id: Uuid) -> Result<bool, OrchestrationError>;

    /// Check the backend is reachable.
    async fn health_check(&self) -> Result<bool, OrchestrationError>;
}
