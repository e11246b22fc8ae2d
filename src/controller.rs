//! Run controller: top-level phase dispatch.
//!
//! Owns the run lock, drives the phase machine through plan, implement,
//! verify, PR and review, and guarantees terminal bookkeeping: whatever
//! happens inside a phase, the run document ends up with an accurate status,
//! a blocked reason where one applies, and a run-finished event.

use std::sync::Arc;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::checkpoint::CheckpointManager;
use crate::collab::{
    invoke_typed, Cognition, CognitionRequest, FixPlan, Implementer, PrHandle, PrSpec,
    ReviewProvider, TaskTracker, VerificationRunner, VersionControl,
};
use crate::config::RunConfig;
use crate::engine::{StepEngine, StepOptions};
use crate::errors::{AgentError, AgentResult, ErrorKind};
use crate::learning::{LearningGate, LearningHistory, LearningNote, RunSignals};
use crate::phase::{Phase, PhaseMachine};
use crate::recovery::{plan_recovery, reclaim_stale_steps, resume_phase, RecoveryAction};
use crate::review::{ReviewLoop, ReviewLoopExit};
use crate::state::events::RunEvent;
use crate::state::model::{Checkpoint, PlanSummary, RunStatus};
use crate::state::store::RunStateStore;
use crate::verify::{AutoFixSettings, VerificationAutoFix};

/// Everything long-running or remote the controller delegates to.
pub struct Collaborators {
    pub cognition: Arc<dyn Cognition>,
    pub implementer: Arc<dyn Implementer>,
    pub vcs: Arc<dyn VersionControl>,
    pub runner: Arc<dyn VerificationRunner>,
    /// Absent when no code-hosting provider is configured; the run then
    /// completes at the PR boundary instead of failing.
    pub provider: Option<Arc<dyn ReviewProvider>>,
    pub tracker: Arc<dyn TaskTracker>,
    pub history: Arc<dyn LearningHistory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

/// Plan-phase cognition output.
#[derive(Debug, Deserialize)]
struct PlanResponse {
    summary: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ImplementReport {
    files_changed: Vec<String>,
    checkpoint_sha: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerifyReport {
    ok: bool,
    auto_fixed: bool,
    failures: Vec<String>,
}

/// Learning-phase cognition output; the note is optional by design.
#[derive(Debug, Deserialize)]
struct NoteResponse {
    #[serde(default)]
    note: Option<LearningNote>,
}

/// Advisory exclusive lock on a run. Released on drop.
struct RunLock {
    _file: std::fs::File,
}

pub struct RunController {
    store: Arc<RunStateStore>,
    config: RunConfig,
    collab: Collaborators,
}

impl RunController {
    pub fn new(store: Arc<RunStateStore>, config: RunConfig, collab: Collaborators) -> Self {
        Self {
            store,
            config,
            collab,
        }
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    fn acquire_lock(&self, run_id: &str) -> AgentResult<RunLock> {
        let path = self.store.lock_path(run_id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AgentError::internal(format!("failed to open run lock: {e}")))?;
        file.try_lock_exclusive().map_err(|_| {
            AgentError::conflict(format!("run {run_id} is locked by another process"))
        })?;
        Ok(RunLock { _file: file })
    }

    /// Start a fresh run and drive it to a stopping point.
    pub async fn start(
        &self,
        run_id: &str,
        task: &str,
        cancel: watch::Receiver<bool>,
    ) -> AgentResult<RunOutcome> {
        self.store.create_run(run_id)?;
        let _lock = self.acquire_lock(run_id)?;
        self.execute(run_id, task, cancel).await
    }

    /// Resume an existing run: reclaim stale leases, route through recovery,
    /// then continue from the persisted phase.
    pub async fn resume(
        &self,
        run_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> AgentResult<RunOutcome> {
        let _lock = self.acquire_lock(run_id)?;
        let doc = self.store.load(run_id)?;
        if doc.run.status.is_terminal() {
            return Ok(RunOutcome {
                run_id: run_id.to_string(),
                status: doc.run.status,
                phase: doc.run.phase,
                blocked_reason: doc.blocked_reason,
            });
        }

        let reclaimed = reclaim_stale_steps(&self.store, run_id)?;
        if !reclaimed.is_empty() {
            tracing::info!(run_id, ?reclaimed, "reclaimed stale steps on resume");
        }
        self.store.update(run_id, |doc| {
            doc.run.attempt += 1;
        })?;
        self.store.append_event(
            run_id,
            RunEvent::RunStarted {
                attempt: self.store.load(run_id)?.run.attempt,
            },
        )?;

        let doc = self.store.load(run_id)?;
        let target = match plan_recovery(&doc) {
            RecoveryAction::AskUser => {
                let reason = doc
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "run is blocked".to_string());
                return Err(AgentError::expected_with_remediation(
                    "run_blocked",
                    reason,
                    vec![
                        "inspect the run document and clear the blocked reason to retry"
                            .to_string(),
                    ],
                ));
            }
            RecoveryAction::RerunVerification => Phase::Verify,
            RecoveryAction::RefetchReviews | RecoveryAction::RestartReviewLoop => Phase::Review,
            RecoveryAction::ResumePhase(phase) => phase,
        };

        if target != doc.run.phase && !doc.run.phase.is_terminal() {
            let machine = PhaseMachine::new(&self.store, run_id);
            machine.transition(Phase::Recovery, Some("resume"))?;
            machine.transition(target, Some("recovery_routed"))?;
        }

        let task = doc
            .plan
            .as_ref()
            .map(|p| p.task_ref.clone())
            .or_else(|| self.config.task_ref.clone())
            .unwrap_or_default();
        self.execute(run_id, &task, cancel).await
    }

    /// Race the phase loop against cancellation, then always run the terminal
    /// bookkeeping.
    async fn execute(
        &self,
        run_id: &str,
        task: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> AgentResult<RunOutcome> {
        // Biased so a pending cancellation is honored before more phase work.
        let driven = tokio::select! {
            biased;
            _ = wait_for_cancel(&mut cancel) => Err(AgentError::Canceled),
            result = self.drive(run_id, task) => result,
        };
        self.finish(run_id, &driven)?;

        let doc = self.store.load(run_id)?;
        let outcome = RunOutcome {
            run_id: run_id.to_string(),
            status: doc.run.status,
            phase: doc.run.phase,
            blocked_reason: doc.blocked_reason,
        };
        driven.map(|_| outcome)
    }

    /// Map the drive result onto a run status and record it.
    fn finish(&self, run_id: &str, result: &AgentResult<()>) -> AgentResult<()> {
        let status = self.store.update(run_id, |doc| {
            let status = match result {
                Ok(()) if doc.run.phase.is_terminal() => RunStatus::Success,
                // Stopped short of completion but resumable (review budget).
                Ok(()) => RunStatus::Running,
                Err(err) => match err.kind() {
                    ErrorKind::Canceled => RunStatus::Canceled,
                    // Needs-human stops keep the run resumable.
                    ErrorKind::Expected => {
                        if doc.blocked_reason.is_none() {
                            doc.blocked_reason = Some(err.to_string());
                        }
                        RunStatus::Running
                    }
                    _ => {
                        if doc.blocked_reason.is_none() {
                            doc.blocked_reason = Some(err.to_string());
                        }
                        RunStatus::Failed
                    }
                },
            };
            doc.run.status = status;
            status
        })?;
        self.store
            .append_event(run_id, RunEvent::RunFinished { status })?;
        tracing::info!(run_id, status = status.as_str(), "run stopped");
        Ok(())
    }

    async fn drive(&self, run_id: &str, task: &str) -> AgentResult<()> {
        let engine = StepEngine::new(Arc::clone(&self.store), run_id);
        let machine = PhaseMachine::new(&self.store, run_id);

        loop {
            let phase = machine.current()?;
            match phase {
                Phase::Idle => {
                    machine.transition(Phase::Plan, Some("run_started"))?;
                }
                Phase::Plan => {
                    self.plan(&engine, run_id, task).await?;
                    machine.transition(Phase::Implement, None)?;
                }
                Phase::Implement => {
                    self.implement(&engine, run_id).await?;
                    machine.transition(Phase::Verify, None)?;
                }
                Phase::Verify => {
                    self.verify(&engine, run_id).await?;
                    machine.transition(Phase::Pr, None)?;
                }
                Phase::Pr => match &self.collab.provider {
                    None => {
                        machine.transition(Phase::Complete, Some("github_unconfigured"))?;
                    }
                    Some(provider) => {
                        self.open_pr(&engine, run_id, provider.as_ref()).await?;
                        machine.transition(Phase::Review, None)?;
                    }
                },
                Phase::Review => {
                    let provider = self.collab.provider.as_deref().ok_or_else(|| {
                        AgentError::expected(
                            "github_unconfigured",
                            "review phase requires a configured code-hosting provider",
                        )
                    })?;
                    match self.review(&engine, run_id, provider).await? {
                        // Converged already moved the phase to complete.
                        ReviewLoopExit::Converged => {}
                        ReviewLoopExit::BudgetExhausted => return Ok(()),
                    }
                }
                Phase::Complete => {
                    self.learn(&engine, run_id).await?;
                    return Ok(());
                }
                Phase::Recovery => {
                    // Normally routed before drive; fall back to the planner.
                    let doc = self.store.load(run_id)?;
                    machine.transition(resume_phase(&doc), Some("recovery_routed"))?;
                }
            }
        }
    }

    async fn plan(&self, engine: &StepEngine, run_id: &str, task: &str) -> AgentResult<()> {
        let task_ref = self
            .config
            .task_ref
            .clone()
            .unwrap_or_else(|| task.to_string());
        let summary: PlanSummary = engine
            .run_step(
                "plan.generate",
                "Generate plan",
                StepOptions::with_inputs(serde_json::json!({ "task": task })),
                |handle| async move {
                    let response: PlanResponse = invoke_typed(
                        self.collab.cognition.as_ref(),
                        CognitionRequest::new(
                            "generate_plan",
                            serde_json::json!({ "task": task }),
                        ),
                    )
                    .await?;
                    handle.heartbeat()?;
                    Ok(PlanSummary {
                        task_ref: task_ref.clone(),
                        summary: response.summary,
                        created_at: Utc::now(),
                    })
                },
            )
            .await?;

        self.store.update(run_id, |doc| {
            doc.plan = Some(summary.clone());
        })?;
        if let Some(task_ref) = &self.config.task_ref
            && let Err(err) = self.collab.tracker.move_task_in_progress(task_ref).await
        {
            // Tracker mirroring is best-effort.
            tracing::warn!(%task_ref, error = %err, "failed to move task in progress");
        }
        Ok(())
    }

    async fn implement(&self, engine: &StepEngine, run_id: &str) -> AgentResult<()> {
        let doc = self.store.load(run_id)?;
        let plan_summary = doc
            .plan
            .as_ref()
            .ok_or_else(|| AgentError::not_found("plan for run"))?
            .summary
            .clone();
        let dry_run = self.config.dry_run;
        let worktree = self.config.worktree.clone();

        let report: ImplementReport = engine
            .run_step(
                "implement.apply",
                "Apply implementation",
                StepOptions::with_inputs(serde_json::json!({ "plan": plan_summary.clone() })),
                |handle| {
                    let worktree = worktree.clone();
                    async move {
                        let plan: FixPlan = invoke_typed(
                            self.collab.cognition.as_ref(),
                            CognitionRequest::new(
                                "implementation_plan",
                                serde_json::json!({ "plan": plan_summary }),
                            ),
                        )
                        .await?;
                        handle.heartbeat()?;

                        if dry_run {
                            tracing::info!("dry run: implementation plan not applied");
                            return Ok(ImplementReport {
                                files_changed: Vec::new(),
                                checkpoint_sha: None,
                            });
                        }

                        let applied = self
                            .collab
                            .implementer
                            .apply_plan(&plan, &worktree)
                            .await?;
                        handle.heartbeat()?;

                        let checkpoints =
                            CheckpointManager::new(self.collab.vcs.as_ref(), &worktree);
                        let outcome = checkpoints.checkpoint(&plan.summary, &[]).await?;
                        Ok(ImplementReport {
                            files_changed: applied.files_changed,
                            checkpoint_sha: outcome.committed.then_some(outcome.sha),
                        })
                    }
                },
            )
            .await?;

        if let Some(sha) = report.checkpoint_sha {
            let files = report.files_changed.clone();
            self.store.update(run_id, move |doc| {
                doc.checkpoints.push(Checkpoint {
                    sha,
                    message: "implementation".to_string(),
                    files,
                    created_at: Utc::now(),
                });
            })?;
        }
        Ok(())
    }

    async fn verify(&self, engine: &StepEngine, run_id: &str) -> AgentResult<()> {
        let worktree = self.config.worktree.clone();
        let settings = AutoFixSettings {
            dry_run: self.config.dry_run,
            allow_mutation: self.config.allow_mutation,
            ..self.config.auto_fix
        };
        let store = Arc::clone(&self.store);

        // Verification observes the worktree, so a recorded pass is not
        // trustworthy across resumes; always re-run.
        let report: VerifyReport = engine
            .run_step(
                "verify.run",
                "Run verification",
                StepOptions {
                    inputs: None,
                    force: true,
                },
                |handle| {
                    let worktree = worktree.clone();
                    let store = Arc::clone(&store);
                    async move {
                        let outcome =
                            self.collab.runner.run(None, &worktree).await?;
                        handle.heartbeat()?;
                        if outcome.ok {
                            return Ok(VerifyReport {
                                ok: true,
                                auto_fixed: false,
                                failures: Vec::new(),
                            });
                        }

                        let auto_fix = VerificationAutoFix::new(
                            &store,
                            run_id,
                            self.collab.cognition.as_ref(),
                            self.collab.implementer.as_ref(),
                            self.collab.runner.as_ref(),
                            self.collab.vcs.as_ref(),
                            &worktree,
                            settings,
                        );
                        let fix = auto_fix
                            .handle_failures(&outcome, || handle.heartbeat())
                            .await?;
                        if fix.fixed {
                            return Ok(VerifyReport {
                                ok: true,
                                auto_fixed: true,
                                failures: Vec::new(),
                            });
                        }
                        let note = fix
                            .triage
                            .and_then(|t| t.note)
                            .unwrap_or_else(|| fix.remaining.join(", "));
                        Err(AgentError::expected(
                            "verification_failed",
                            format!("verification failed: {note}"),
                        ))
                    }
                },
            )
            .await?;

        if report.auto_fixed {
            tracing::info!(run_id, "verification passed after auto-fix");
        }
        Ok(())
    }

    async fn open_pr(
        &self,
        engine: &StepEngine,
        run_id: &str,
        provider: &dyn ReviewProvider,
    ) -> AgentResult<PrHandle> {
        let doc = self.store.load(run_id)?;
        let plan = doc
            .plan
            .as_ref()
            .ok_or_else(|| AgentError::not_found("plan for run"))?;
        let spec = PrSpec {
            title: plan.summary.clone(),
            body: format!("Automated change for {}", plan.task_ref),
            branch: self.config.branch.clone(),
            base: self.config.base_branch.clone(),
        };
        let worktree = self.config.worktree.clone();

        let pr: PrHandle = engine
            .run_step(
                "github.pr.open",
                "Open pull request",
                StepOptions::with_inputs(serde_json::json!({
                    "branch": spec.branch.clone(),
                    "base": spec.base.clone(),
                })),
                |handle| {
                    let spec = spec.clone();
                    let worktree = worktree.clone();
                    async move {
                        CheckpointManager::new(self.collab.vcs.as_ref(), &worktree)
                            .push()
                            .await?;
                        handle.heartbeat()?;
                        provider.open_or_update_pr(&spec).await
                    }
                },
            )
            .await?;

        self.store.update(run_id, |doc| {
            let summary = doc.review.get_or_insert_with(Default::default);
            summary.pr_number = Some(pr.number);
        })?;
        if let Some(task_ref) = &self.config.task_ref {
            if let Err(err) = self.collab.tracker.move_task_in_review(task_ref).await {
                tracing::warn!(%task_ref, error = %err, "failed to move task in review");
            }
            if let Err(err) = self.collab.tracker.comment_on_pr_open(task_ref, &pr).await {
                tracing::warn!(%task_ref, error = %err, "failed to comment on PR open");
            }
        }
        Ok(pr)
    }

    async fn review(
        &self,
        engine: &StepEngine,
        run_id: &str,
        provider: &dyn ReviewProvider,
    ) -> AgentResult<ReviewLoopExit> {
        // The PR handle is the recorded output of the (idempotent) PR step.
        let pr: PrHandle = self
            .store
            .read_artifact(run_id, "github.pr.open", crate::engine::OUTPUT_ARTIFACT)?;

        let mut cfg = self.config.review.clone();
        cfg.allow_mutation = cfg.allow_mutation && self.config.allow_mutation;

        ReviewLoop::new(
            engine,
            self.collab.cognition.as_ref(),
            provider,
            self.collab.implementer.as_ref(),
            self.collab.runner.as_ref(),
            self.collab.vcs.as_ref(),
            self.collab.tracker.as_ref(),
            &self.config.worktree,
            pr,
            self.config.task_ref.clone(),
            cfg,
        )
        .run()
        .await
    }

    /// Completed runs may persist a learning note, gated on confidence.
    async fn learn(&self, engine: &StepEngine, run_id: &str) -> AgentResult<()> {
        let doc = self.store.load(run_id)?;
        if doc.learning.is_some() {
            return Ok(());
        }
        let signals = match &doc.review {
            Some(review) => RunSignals {
                ci_passed: review.last_ci.as_deref() == Some("passing"),
                unresolved_reviews: 0,
                ship_it: review.converged && review.iterations <= 1,
            },
            // No review happened; CI never ran against this change.
            None => RunSignals::default(),
        };
        let store = Arc::clone(&self.store);
        let worktree = self.config.worktree.clone();
        let config = self.config.learning.clone();

        let _: serde_json::Value = engine
            .run_step(
                "learning.gate",
                "Learning gate",
                StepOptions::default(),
                |handle| {
                    let store = Arc::clone(&store);
                    let worktree = worktree.clone();
                    let config = config.clone();
                    async move {
                        let response: NoteResponse = invoke_typed(
                            self.collab.cognition.as_ref(),
                            CognitionRequest::new("learning_note", serde_json::json!({})),
                        )
                        .await?;
                        handle.heartbeat()?;
                        let Some(note) = response.note else {
                            return Ok(serde_json::json!({ "status": "no_note" }));
                        };
                        let gate = LearningGate::new(
                            &store,
                            run_id,
                            self.collab.history.as_ref(),
                            self.collab.vcs.as_ref(),
                            &worktree,
                            config,
                        );
                        let decision = gate.decide_and_apply(&note, signals).await?;
                        serde_json::to_value(&decision)
                            .map_err(|e| AgentError::internal(e.to_string()))
                    }
                },
            )
            .await?;
        Ok(())
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}
