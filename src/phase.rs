//! Run phase state machine.
//!
//! A run moves forward through `idle → plan → implement → verify → pr →
//! review → complete`. Phases may be skipped forward (e.g. `verify →
//! complete` when no review provider is configured) but are never revisited
//! automatically; the review phase loops internally without phase churn.
//! `recovery` is a cross-cutting entry reachable from any non-terminal state.

use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};
use crate::state::events::RunEvent;
use crate::state::store::RunStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Plan,
    Implement,
    Verify,
    Pr,
    Review,
    Complete,
    Recovery,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Verify => "verify",
            Phase::Pr => "pr",
            Phase::Review => "review",
            Phase::Complete => "complete",
            Phase::Recovery => "recovery",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }

    /// Position in the forward chain. `recovery` sits outside the chain.
    fn order(&self) -> Option<u8> {
        match self {
            Phase::Idle => Some(0),
            Phase::Plan => Some(1),
            Phase::Implement => Some(2),
            Phase::Verify => Some(3),
            Phase::Pr => Some(4),
            Phase::Review => Some(5),
            Phase::Complete => Some(6),
            Phase::Recovery => None,
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(&self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.order(), to.order()) {
            // Recovery is reachable from any non-terminal phase.
            (_, None) => true,
            // Leaving recovery re-enters any working phase.
            (None, Some(t)) => t > 0 && t < 7,
            // Forward-only within the chain; jumps are allowed.
            (Some(f), Some(t)) => t > f,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persists phase transitions and emits phase-changed events.
pub struct PhaseMachine<'a> {
    store: &'a RunStateStore,
    run_id: String,
}

impl<'a> PhaseMachine<'a> {
    pub fn new(store: &'a RunStateStore, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn current(&self) -> AgentResult<Phase> {
        Ok(self.store.load(&self.run_id)?.run.phase)
    }

    /// Transition to `to`, persisting the new phase and emitting a
    /// phase-changed event carrying `from`, `to` and the optional reason.
    /// Validated before writing: a rejected transition never touches the
    /// document, so no crash window can persist an illegal phase.
    pub fn transition(&self, to: Phase, reason: Option<&str>) -> AgentResult<Phase> {
        let from = self.current()?;
        if !from.can_transition_to(to) {
            return Err(AgentError::conflict(format!(
                "illegal phase transition {from} -> {to}"
            )));
        }
        self.store.update(&self.run_id, |doc| {
            doc.run.phase = to;
        })?;

        tracing::info!(run_id = %self.run_id, %from, %to, reason, "phase transition");
        self.store.append_event(
            &self.run_id,
            RunEvent::PhaseChanged {
                from,
                to,
                reason: reason.map(|r| r.to_string()),
            },
        )?;
        Ok(from)
    }
}
