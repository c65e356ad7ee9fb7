// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-proposal context threaded through the rule pipeline.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::RunRecord;
use crate::states::State;

/// State of one transition evaluation.
///
/// Built by the engine from a fresh read of the run, mutated by rules, and
/// dropped once the proposal is persisted or rejected.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    /// The run as read before evaluation.
    pub run: RunRecord,
    /// The state being proposed. Rules may rewrite it.
    pub proposed_state: State,
    /// Evaluation time, used by time-dependent rules.
    pub now: DateTime<Utc>,
    applied_rules: Vec<&'static str>,
}

impl OrchestrationContext {
    /// Start evaluating `proposed_state` against `run`.
    pub fn new(run: RunRecord, proposed_state: State, now: DateTime<Utc>) -> Self {
        Self {
            run,
            proposed_state,
            now,
            applied_rules: Vec::new(),
        }
    }

    /// The run being transitioned.
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// The run's current state.
    pub fn initial_state(&self) -> &State {
        &self.run.state
    }

    /// Names of the rules that ran, in order.
    pub fn applied_rules(&self) -> &[&'static str] {
        &self.applied_rules
    }

    pub(crate) fn record_rule(&mut self, rule: &'static str) {
        self.applied_rules.push(rule);
    }
}
