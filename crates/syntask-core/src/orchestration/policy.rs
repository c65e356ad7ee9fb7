// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ordered rule pipelines.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::OrchestrationError;

use super::OrchestrationContext;
use super::rules::{
    CopyScheduledTime, EnsureOnlyScheduledRunsMarkedLate, OrchestrationRule,
    PreventPendingTransitions, RequireLateScheduledTime, RuleOutcome, WaitForScheduledTime,
};

/// An ordered list of rules applied to every proposal.
///
/// Rules run strictly in order and the first abort short-circuits the rest.
#[derive(Clone)]
pub struct Policy {
    name: &'static str,
    rules: Vec<Arc<dyn OrchestrationRule>>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field(
                "rules",
                &self.rules.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Policy {
    /// A policy made of `rules`, in order.
    pub fn new(name: &'static str, rules: Vec<Arc<dyn OrchestrationRule>>) -> Self {
        Self { name, rules }
    }

    /// Policy applied to transitions proposed by API callers.
    pub fn core() -> Self {
        Self::new(
            "CoreFlowPolicy",
            vec![
                Arc::new(PreventPendingTransitions),
                Arc::new(CopyScheduledTime),
                Arc::new(WaitForScheduledTime),
                Arc::new(RequireLateScheduledTime),
            ],
        )
    }

    /// Policy applied by the late-run detector.
    pub fn mark_late_runs() -> Self {
        Self::new(
            "MarkLateRunsPolicy",
            vec![
                Arc::new(EnsureOnlyScheduledRunsMarkedLate),
                Arc::new(RequireLateScheduledTime),
            ],
        )
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: Arc<dyn OrchestrationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Policy name, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Names of the rules, in evaluation order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Run every applicable rule against `ctx`.
    pub(crate) fn apply(&self, ctx: &mut OrchestrationContext) -> Result<(), OrchestrationError> {
        for rule in &self.rules {
            if !rule.applies_to(ctx) {
                continue;
            }

            ctx.record_rule(rule.name());
            if let RuleOutcome::Abort(reason) = rule.before_transition(ctx) {
                debug!(
                    run_id = %ctx.run_id(),
                    policy = self.name,
                    rule = rule.name(),
                    reason = %reason,
                    "Rule aborted transition"
                );
                return Err(OrchestrationError::PolicyRejected {
                    run_id: ctx.run_id(),
                    rule: rule.name(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::core()
    }
}
