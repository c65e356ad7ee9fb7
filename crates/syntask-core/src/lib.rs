// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Syntask Core - Run-State Orchestration
//!
//! This crate tracks flow and task runs through their lifecycle of states and
//! runs the background services built on top of that lifecycle.
//!
//! # Architecture
//!
//! ```text
//!   API handlers ──► propose_transition ──┐
//!                                         ▼
//!   LateRunsService ─────────────► OrchestrationEngine ──► RunStore (SQLite)
//!   (marks overdue runs Late)      (transition table,        │
//!                                   policy rules)            │ state-change
//!                                         │                  │ events
//!                                         ▼                  ▼
//!                                   EventPublisher ───► EventSubscriber
//!                                                            │
//!                                                            ▼
//!                                                       RunWaiter
//!                                                  (wait_for_run, callbacks)
//!
//!   ApiLogWorker ──► BatchedQueue ──► BatchSink (bounded batches, timed flush)
//! ```
//!
//! # States
//!
//! | Type | Terminal | Notes |
//! |------|----------|-------|
//! | `SCHEDULED` | no | `Late` and `AwaitingRetry` are named sub-states |
//! | `PENDING` | no | |
//! | `RUNNING` | no | |
//! | `PAUSED` | no | |
//! | `COMPLETED` | yes | |
//! | `FAILED` | yes | |
//! | `CRASHED` | yes | |
//! | `CANCELLED` | yes | |
//!
//! # Background Services
//!
//! | Service | Trigger | Failure handling |
//! |---------|---------|------------------|
//! | [`late_runs::LateRunsService`] | every `loop_interval` | skips runs that moved on, logs the rest |
//! | [`waiter::RunWaiter`] | completion events | logs malformed events and keeps consuming |
//! | [`batching::BatchedQueue`] | size, count or interval | logs and drops failed batches |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by the
//! `syntask-services` binary.

#![deny(missing_docs)]

pub mod batching;
pub mod config;
pub mod error;
pub mod events;
pub mod late_runs;
pub mod logs;
pub mod migrations;
pub mod orchestration;
pub mod persistence;
pub mod runtime;
pub mod states;
pub mod waiter;

pub use error::{OrchestrationError, Result};
pub use orchestration::{AppliedState, OrchestrationEngine, Policy};
pub use persistence::{RunStore, SqliteRunStore};
pub use runtime::ServicesRuntime;
pub use states::{RunKind, State, StateType};
pub use waiter::{RunWaiter, RunWaiterHandle};
