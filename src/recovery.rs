//! Crash recovery.
//!
//! On resume, any step still marked running whose lease went stale is
//! reclaimed: marked failed with a structured error so the engine re-runs it.
//! The planner then maps the persisted phase and blocked reason to a concrete
//! recovery action instead of guessing.

use chrono::Utc;

use crate::errors::AgentResult;
use crate::phase::Phase;
use crate::state::events::RunEvent;
use crate::state::model::{ErrorRecord, RunDocument, StepStatus, LEASE_STALENESS};
use crate::state::store::RunStateStore;

pub const LEASE_STALE_CODE: &str = "lease_stale";

/// Mark stale-leased running steps failed so they re-run. Returns the
/// reclaimed step ids.
pub fn reclaim_stale_steps(store: &RunStateStore, run_id: &str) -> AgentResult<Vec<String>> {
    let now = Utc::now();
    let reclaimed = store.update(run_id, move |doc| {
        let stale = doc.stale_running_steps(now);
        for step_id in &stale {
            let rec = doc.step_mut(step_id);
            rec.status = StepStatus::Failed;
            rec.ended_at = Some(now);
            rec.lease = None;
            rec.error = Some(ErrorRecord {
                code: LEASE_STALE_CODE.to_string(),
                message: format!(
                    "no heartbeat within {}s; assuming crash",
                    LEASE_STALENESS.num_seconds()
                ),
                at: now,
            });
            if doc.current_step.as_deref() == Some(step_id.as_str()) {
                doc.current_step = None;
            }
        }
        stale
    })?;

    for step_id in &reclaimed {
        tracing::warn!(run_id, step_id, "reclaimed stale step lease");
        store.append_event(
            run_id,
            RunEvent::StepFinished {
                step_id: step_id.clone(),
                status: StepStatus::Failed,
                outputs_digest: None,
                error: Some("stale lease reclaimed".to_string()),
            },
        )?;
    }
    Ok(reclaimed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing special to repair; pick up the run at this phase.
    ResumePhase(Phase),
    /// Verification state is untrusted after a crash; run it again.
    RerunVerification,
    /// Resume review with a fresh unresolved-thread fetch.
    RefetchReviews,
    /// The loop crashed before recording any iteration; start it over.
    RestartReviewLoop,
    /// A human recorded or caused the stop; do not retry automatically.
    AskUser,
}

/// Map persisted run state to a recovery action.
pub fn plan_recovery(doc: &RunDocument) -> RecoveryAction {
    if doc.blocked_reason.is_some() {
        return RecoveryAction::AskUser;
    }
    match doc.run.phase {
        Phase::Verify => RecoveryAction::RerunVerification,
        Phase::Review => {
            if doc.review.is_some() {
                RecoveryAction::RefetchReviews
            } else {
                RecoveryAction::RestartReviewLoop
            }
        }
        phase => RecoveryAction::ResumePhase(resume_phase_for(doc, phase)),
    }
}

fn resume_phase_for(doc: &RunDocument, phase: Phase) -> Phase {
    if phase.is_terminal() {
        return Phase::Complete;
    }
    // Without a persisted plan nothing downstream can be trusted.
    if doc.plan.is_none() {
        return Phase::Plan;
    }
    if phase == Phase::Idle { Phase::Plan } else { phase }
}

/// Phase a resumed run should re-enter.
pub fn resume_phase(doc: &RunDocument) -> Phase {
    resume_phase_for(doc, doc.run.phase)
}
