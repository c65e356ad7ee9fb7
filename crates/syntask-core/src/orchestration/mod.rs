// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State orchestration.
//!
//! Every state change goes through [`OrchestrationEngine::propose_transition`]:
//!
//! 1. Read the run's current state.
//! 2. Check the proposed state type is reachable from the current one.
//! 3. Run the policy's rules, which may rewrite or abort the proposal.
//! 4. Write the new state, conditional on the current state not having changed
//!    since step 1.
//!
//! The engine never retries. Callers decide how to treat each
//! [`OrchestrationError`]: the late-run detector skips runs that vanished or
//! moved on, API callers surface the error.

pub mod context;
pub mod policy;
pub mod rules;

pub use self::context::OrchestrationContext;
pub use self::policy::Policy;
pub use self::rules::{OrchestrationRule, RuleOutcome};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};
use crate::events::{Event, EventPublisher};
use crate::persistence::RunStore;
use crate::states::State;

/// A transition that was validated and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedState {
    /// The run.
    pub run_id: Uuid,
    /// State the run was in before the transition.
    pub previous: State,
    /// State now stored for the run, after rule rewrites.
    pub state: State,
}

/// Validates proposed states and persists the accepted ones.
#[derive(Clone)]
pub struct OrchestrationEngine {
    store: Arc<dyn RunStore>,
    default_policy: Policy,
    events: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("store", &"...")
            .field("default_policy", &self.default_policy)
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl OrchestrationEngine {
    /// Engine over `store` using [`Policy::core`] for [`propose`](Self::propose).
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            default_policy: Policy::core(),
            events: None,
        }
    }

    /// Publish an event for every applied transition.
    pub fn with_events(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(publisher);
        self
    }

    /// Replace the policy used by [`propose`](Self::propose).
    pub fn with_default_policy(mut self, policy: Policy) -> Self {
        self.default_policy = policy;
        self
    }

    /// The run store.
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Propose `state` for a run under the default policy.
    pub async fn propose(&self, run_id: Uuid, state: State) -> Result<AppliedState> {
        self.propose_transition(run_id, state, &self.default_policy)
            .await
    }

    /// Propose `state` for a run under `policy`.
    pub async fn propose_transition(
        &self,
        run_id: Uuid,
        state: State,
        policy: &Policy,
    ) -> Result<AppliedState> {
        self.propose_transition_at(run_id, state, policy, Utc::now())
            .await
    }

    /// Propose `state` for a run under `policy`, evaluating time-dependent rules
    /// against `now`.
    pub async fn propose_transition_at(
        &self,
        run_id: Uuid,
        state: State,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<AppliedState> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestrationError::RunNotFound { run_id })?;

        let from = run.state.state_type;
        let to = state.state_type;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition { run_id, from, to });
        }

        let mut ctx = OrchestrationContext::new(run, state, now);
        policy.apply(&mut ctx)?;

        let expected_state_id = ctx.initial_state().id;
        let record = self
            .store
            .write_state(run_id, &ctx.proposed_state, expected_state_id)
            .await?;

        debug!(
            run_id = %run_id,
            policy = policy.name(),
            from = %ctx.run.state,
            to = %record.state,
            "Applied state transition"
        );

        if let Some(events) = &self.events {
            events.publish(Event::run_state_changed(&record, &ctx.run.state));
        }

        Ok(AppliedState {
            run_id,
            previous: ctx.run.state,
            state: record.state,
        })
    }
}
