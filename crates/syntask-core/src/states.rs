// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run states and the transition table.
//!
//! A run's lifecycle is described by a coarse [`StateType`] plus a human-readable
//! state name. Sub-states such as `Late` or `AwaitingRetry` keep the `SCHEDULED`
//! type and only change the name, so marking a run late never looks like a start.
//!
//! ```text
//!   SCHEDULED ──► PENDING ──► RUNNING ──► COMPLETED
//!      │  ▲          │           │   ├──► FAILED
//!      │  └── Late   │           │   └──► CRASHED
//!      │             │           ▼
//!      │             │        PAUSED ──► RUNNING
//!      └─────────────┴──────────────────► CANCELLED
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State name used for the `Late` sub-state of `SCHEDULED`.
pub const LATE_STATE_NAME: &str = "Late";

/// State name used for the plain `SCHEDULED` state.
pub const SCHEDULED_STATE_NAME: &str = "Scheduled";

/// State name used when a failed run is waiting for its next attempt.
pub const AWAITING_RETRY_STATE_NAME: &str = "AwaitingRetry";

/// Coarse lifecycle category of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Waiting for its scheduled start time.
    Scheduled,
    /// Picked up for execution but not started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Infrastructure failure; the run stopped unexpectedly.
    Crashed,
    /// Cancelled before finishing.
    Cancelled,
    /// Suspended until resumed.
    Paused,
}

impl StateType {
    /// All state types, in lifecycle order.
    pub const ALL: [StateType; 8] = [
        Self::Scheduled,
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Crashed,
        Self::Cancelled,
        Self::Paused,
    ];

    /// Terminal state types.
    pub const TERMINAL: [StateType; 4] =
        [Self::Completed, Self::Failed, Self::Crashed, Self::Cancelled];

    /// Whether no further transitions are expected from this type.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Crashed | Self::Cancelled
        )
    }

    /// Database and wire representation (`SCHEDULED`, `RUNNING`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Crashed => "CRASHED",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        }
    }

    /// Default human-readable name for a state of this type.
    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Scheduled => SCHEDULED_STATE_NAME,
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Crashed => "Crashed",
            Self::Cancelled => "Cancelled",
            Self::Paused => "Paused",
        }
    }

    /// Target types reachable from this type.
    pub fn allowed_targets(&self) -> &'static [StateType] {
        use StateType::*;
        match self {
            Scheduled => &[Scheduled, Pending, Running, Cancelled, Crashed],
            Pending => &[Pending, Running, Scheduled, Cancelled, Crashed, Failed],
            Running => &[Completed, Failed, Crashed, Cancelled, Paused, Scheduled],
            Paused => &[Running, Pending, Scheduled, Cancelled, Crashed, Failed],
            Completed | Failed | Crashed | Cancelled => &[],
        }
    }

    /// Whether `target` is reachable from this type.
    pub fn can_transition_to(&self, target: StateType) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CRASHED" => Ok(Self::Crashed),
            "CANCELLED" => Ok(Self::Cancelled),
            "PAUSED" => Ok(Self::Paused),
            _ => Err(format!("Invalid state type: {s}")),
        }
    }
}

/// Kind of run a state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// A run of a flow.
    FlowRun,
    /// A run of a task inside a flow run.
    TaskRun,
}

impl RunKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowRun => "flow_run",
            Self::TaskRun => "task_run",
        }
    }

    /// Prefix of this kind's event resource ids, e.g. `syntask.task-run.`.
    pub fn resource_prefix(&self) -> &'static str {
        match self {
            Self::FlowRun => "syntask.flow-run.",
            Self::TaskRun => "syntask.task-run.",
        }
    }

    /// Event name emitted when a run of this kind enters a state type,
    /// e.g. `syntask.task-run.Completed`.
    pub fn event_name(&self, state_type: StateType) -> String {
        format!("{}{}", self.resource_prefix(), state_type.default_name())
    }

    /// Event names for every terminal state of this kind.
    pub fn terminal_event_names(&self) -> Vec<String> {
        StateType::TERMINAL
            .iter()
            .map(|state_type| self.event_name(*state_type))
            .collect()
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow_run" => Ok(Self::FlowRun),
            "task_run" => Ok(Self::TaskRun),
            _ => Err(format!("Invalid run kind: {s}")),
        }
    }
}

/// Extra data attached to a state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDetails {
    /// When a scheduled run is expected to start. `Late` states keep the
    /// original scheduled time here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Cache key of a cached result, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Deadline for a paused run, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_timeout: Option<DateTime<Utc>>,
}

/// A single state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Unique id of this state; used to detect concurrent writers.
    pub id: Uuid,
    /// Coarse state type.
    #[serde(rename = "type")]
    pub state_type: StateType,
    /// Human-readable name, e.g. `Late`.
    pub name: String,
    /// When the state was created.
    pub timestamp: DateTime<Utc>,
    /// Optional message, e.g. a failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Extra data.
    #[serde(default)]
    pub details: StateDetails,
}

impl State {
    /// A new state of the given type with its default name.
    pub fn new(state_type: StateType) -> Self {
        Self::named(state_type, state_type.default_name())
    }

    /// A new state of the given type with a custom name.
    pub fn named(state_type: StateType, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state_type,
            name: name.into(),
            timestamp: Utc::now(),
            message: None,
            details: StateDetails::default(),
        }
    }

    /// `SCHEDULED` state expected to start at `scheduled_time`.
    pub fn scheduled(scheduled_time: DateTime<Utc>) -> Self {
        Self::new(StateType::Scheduled).with_scheduled_time(scheduled_time)
    }

    /// `Late` sub-state of `SCHEDULED`, remembering the original scheduled time.
    pub fn late(scheduled_time: DateTime<Utc>) -> Self {
        Self::named(StateType::Scheduled, LATE_STATE_NAME).with_scheduled_time(scheduled_time)
    }

    /// `AwaitingRetry` sub-state of `SCHEDULED`.
    pub fn awaiting_retry(scheduled_time: DateTime<Utc>) -> Self {
        Self::named(StateType::Scheduled, AWAITING_RETRY_STATE_NAME)
            .with_scheduled_time(scheduled_time)
    }

    /// `PENDING` state.
    pub fn pending() -> Self {
        Self::new(StateType::Pending)
    }

    /// `RUNNING` state.
    pub fn running() -> Self {
        Self::new(StateType::Running)
    }

    /// `COMPLETED` state.
    pub fn completed() -> Self {
        Self::new(StateType::Completed)
    }

    /// `FAILED` state with a reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StateType::Failed).with_message(message)
    }

    /// `CRASHED` state with a reason.
    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(StateType::Crashed).with_message(message)
    }

    /// `CANCELLED` state.
    pub fn cancelled() -> Self {
        Self::new(StateType::Cancelled)
    }

    /// `PAUSED` state.
    pub fn paused() -> Self {
        Self::new(StateType::Paused)
    }

    /// Set the scheduled time.
    pub fn with_scheduled_time(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.details.scheduled_time = Some(scheduled_time);
        self
    }

    /// Set the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this is the `Late` sub-state.
    pub fn is_late(&self) -> bool {
        self.state_type == StateType::Scheduled && self.name == LATE_STATE_NAME
    }

    /// Whether this is a plain, not-yet-late `SCHEDULED` state.
    pub fn is_plain_scheduled(&self) -> bool {
        self.state_type == StateType::Scheduled && self.name == SCHEDULED_STATE_NAME
    }

    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.state_type)
    }
}
