// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration rules.
//!
//! A rule declares which transitions it cares about and, for those, may let the
//! proposal through, rewrite it, or abort it with a reason.

use crate::states::StateType;

use super::OrchestrationContext;

/// What a rule decided about a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Let the remaining rules run.
    Continue,
    /// Reject the proposal.
    Abort(String),
}

/// A single step of an orchestration policy.
pub trait OrchestrationRule: Send + Sync {
    /// Name reported when the rule aborts a proposal.
    fn name(&self) -> &'static str;

    /// State types of the current state this rule applies to.
    fn from_states(&self) -> &'static [StateType] {
        &StateType::ALL
    }

    /// State types of the proposed state this rule applies to.
    fn to_states(&self) -> &'static [StateType] {
        &StateType::ALL
    }

    /// Whether the rule runs for this proposal.
    fn applies_to(&self, ctx: &OrchestrationContext) -> bool {
        self.from_states()
            .contains(&ctx.initial_state().state_type)
            && self.to_states().contains(&ctx.proposed_state.state_type)
    }

    /// Inspect and optionally rewrite the proposal.
    fn before_transition(&self, ctx: &mut OrchestrationContext) -> RuleOutcome;
}

/// Only plain `Scheduled` runs may be marked `Late`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnsureOnlyScheduledRunsMarkedLate;

impl OrchestrationRule for EnsureOnlyScheduledRunsMarkedLate {
    fn name(&self) -> &'static str {
        "EnsureOnlyScheduledRunsMarkedLate"
    }

    fn to_states(&self) -> &'static [StateType] {
        &[StateType::Scheduled]
    }

    fn applies_to(&self, ctx: &OrchestrationContext) -> bool {
        ctx.proposed_state.is_late()
    }

    fn before_transition(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let initial = ctx.initial_state();
        if initial.is_plain_scheduled() {
            RuleOutcome::Continue
        } else {
            RuleOutcome::Abort(format!(
                "Only runs in state Scheduled(SCHEDULED) can be marked late, run is {}",
                initial
            ))
        }
    }
}

/// A run that is already pending cannot be made pending again.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreventPendingTransitions;

impl OrchestrationRule for PreventPendingTransitions {
    fn name(&self) -> &'static str {
        "PreventPendingTransitions"
    }

    fn from_states(&self) -> &'static [StateType] {
        &[StateType::Pending]
    }

    fn to_states(&self) -> &'static [StateType] {
        &[StateType::Pending]
    }

    fn before_transition(&self, _ctx: &mut OrchestrationContext) -> RuleOutcome {
        RuleOutcome::Abort("This run is already in a PENDING state".to_string())
    }
}

/// Carries the scheduled time forward when a scheduled run is picked up.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyScheduledTime;

impl OrchestrationRule for CopyScheduledTime {
    fn name(&self) -> &'static str {
        "CopyScheduledTime"
    }

    fn from_states(&self) -> &'static [StateType] {
        &[StateType::Scheduled]
    }

    fn to_states(&self) -> &'static [StateType] {
        &[StateType::Pending]
    }

    fn before_transition(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        if ctx.proposed_state.details.scheduled_time.is_none() {
            ctx.proposed_state.details.scheduled_time = ctx.initial_state().details.scheduled_time;
        }
        RuleOutcome::Continue
    }
}

/// A scheduled run cannot become pending before its scheduled time.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitForScheduledTime;

impl OrchestrationRule for WaitForScheduledTime {
    fn name(&self) -> &'static str {
        "WaitForScheduledTime"
    }

    fn from_states(&self) -> &'static [StateType] {
        &[StateType::Scheduled]
    }

    fn to_states(&self) -> &'static [StateType] {
        &[StateType::Pending]
    }

    fn before_transition(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        let scheduled_time = ctx
            .proposed_state
            .details
            .scheduled_time
            .or(ctx.initial_state().details.scheduled_time);

        match scheduled_time {
            Some(at) if at > ctx.now => {
                let delay = (at - ctx.now).num_milliseconds() as f64 / 1000.0;
                RuleOutcome::Abort(format!(
                    "Run is scheduled to start in {delay:.1}s, at {}",
                    at.to_rfc3339()
                ))
            }
            _ => RuleOutcome::Continue,
        }
    }
}

/// `Late` states always carry the scheduled time they are late against.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireLateScheduledTime;

impl OrchestrationRule for RequireLateScheduledTime {
    fn name(&self) -> &'static str {
        "RequireLateScheduledTime"
    }

    fn to_states(&self) -> &'static [StateType] {
        &[StateType::Scheduled]
    }

    fn applies_to(&self, ctx: &OrchestrationContext) -> bool {
        ctx.proposed_state.is_late()
    }

    fn before_transition(&self, ctx: &mut OrchestrationContext) -> RuleOutcome {
        if ctx.proposed_state.details.scheduled_time.is_some() {
            return RuleOutcome::Continue;
        }

        match ctx.initial_state().details.scheduled_time {
            Some(at) => {
                ctx.proposed_state.details.scheduled_time = Some(at);
                RuleOutcome::Continue
            }
            None => RuleOutcome::Abort("Run has no scheduled time to be late against".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::RunRecord;
    use crate::states::{RunKind, State};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn context(initial: State, proposed: State) -> OrchestrationContext {
        let now = Utc::now();
        let run = RunRecord {
            id: Uuid::new_v4(),
            kind: RunKind::FlowRun,
            flow_id: Uuid::new_v4(),
            name: "test".to_string(),
            next_scheduled_start_time: initial.details.scheduled_time,
            state: initial,
            created_at: now,
            updated_at: now,
        };
        OrchestrationContext::new(run, proposed, now)
    }

    #[test]
    fn test_late_only_from_plain_scheduled() {
        let rule = EnsureOnlyScheduledRunsMarkedLate;
        let at = Utc::now() - Duration::minutes(5);

        let mut ctx = context(State::scheduled(at), State::late(at));
        assert!(rule.applies_to(&ctx));
        assert_eq!(rule.before_transition(&mut ctx), RuleOutcome::Continue);

        let mut ctx = context(State::late(at), State::late(at));
        assert!(matches!(
            rule.before_transition(&mut ctx),
            RuleOutcome::Abort(_)
        ));

        let mut ctx = context(State::awaiting_retry(at), State::late(at));
        assert!(matches!(
            rule.before_transition(&mut ctx),
            RuleOutcome::Abort(_)
        ));
    }

    #[test]
    fn test_late_rules_ignore_other_proposals() {
        let at = Utc::now();
        let ctx = context(State::scheduled(at), State::scheduled(at));
        assert!(!EnsureOnlyScheduledRunsMarkedLate.applies_to(&ctx));
        assert!(!RequireLateScheduledTime.applies_to(&ctx));
    }

    #[test]
    fn test_prevent_pending_to_pending() {
        let rule = PreventPendingTransitions;

        let mut ctx = context(State::pending(), State::pending());
        assert!(rule.applies_to(&ctx));
        assert!(matches!(
            rule.before_transition(&mut ctx),
            RuleOutcome::Abort(_)
        ));

        let ctx = context(State::pending(), State::running());
        assert!(!rule.applies_to(&ctx));
    }

    #[test]
    fn test_copy_scheduled_time() {
        let at = Utc::now() - Duration::seconds(10);
        let mut ctx = context(State::scheduled(at), State::pending());

        assert!(CopyScheduledTime.applies_to(&ctx));
        assert_eq!(
            CopyScheduledTime.before_transition(&mut ctx),
            RuleOutcome::Continue
        );
        assert_eq!(ctx.proposed_state.details.scheduled_time, Some(at));
    }

    #[test]
    fn test_wait_for_scheduled_time() {
        let rule = WaitForScheduledTime;

        let mut ctx = context(
            State::scheduled(Utc::now() + Duration::hours(1)),
            State::pending(),
        );
        match rule.before_transition(&mut ctx) {
            RuleOutcome::Abort(reason) => assert!(reason.starts_with("Run is scheduled to start")),
            RuleOutcome::Continue => panic!("Expected abort"),
        }

        let mut ctx = context(
            State::scheduled(Utc::now() - Duration::hours(1)),
            State::pending(),
        );
        assert_eq!(rule.before_transition(&mut ctx), RuleOutcome::Continue);
    }

    #[test]
    fn test_require_late_scheduled_time_fills_from_current() {
        let at = Utc::now() - Duration::minutes(3);
        let mut proposed = State::late(at);
        proposed.details.scheduled_time = None;

        let mut ctx = context(State::scheduled(at), proposed);
        assert_eq!(
            RequireLateScheduledTime.before_transition(&mut ctx),
            RuleOutcome::Continue
        );
        assert_eq!(ctx.proposed_state.details.scheduled_time, Some(at));
    }

    #[test]
    fn test_require_late_scheduled_time_aborts_without_time() {
        let mut proposed = State::late(Utc::now());
        proposed.details.scheduled_time = None;

        let mut ctx = context(State::new(StateType::Scheduled), proposed);
        assert!(matches!(
            RequireLateScheduledTime.before_transition(&mut ctx),
            RuleOutcome::Abort(_)
        ));
    }
}
