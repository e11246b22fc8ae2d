//! Review loop orchestrator.
//!
//! Each bounded iteration: wait for CI, fix CI failures or triage them as
//! flakes, fetch and fingerprint unresolved review threads, classify them,
//! partition by the severity policy, auto-resolve what the policy allows,
//! generate and apply a fix plan for the rest, verify, checkpoint, push and
//! record a structured iteration report. The loop exits on clean convergence,
//! iteration budget exhaustion (not an error) or a blocking failure, which
//! persists a `blocked_reason` before propagating.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::collab::{
    invoke_typed, wait_for_ci, CiState, CiWaitOptions, Cognition, CognitionRequest, FixPlan,
    Implementer, PrHandle, ReviewProvider, TaskTracker, VerificationRunner, VersionControl,
};
use crate::engine::{StepEngine, StepHandle, StepOptions};
use crate::errors::{AgentError, AgentResult};
use crate::phase::{Phase, PhaseMachine};
use crate::review::fingerprint::{fingerprint_thread, ThreadFingerprint};
use crate::review::severity::{ClassifiedThread, CoarseBucket, Severity, SeverityPolicy};
use crate::state::model::ReviewSummary;
use crate::util::digest_str;

#[derive(Debug, Clone)]
pub struct ReviewLoopConfig {
    pub max_iterations: u32,
    pub ci_wait: CiWaitOptions,
    pub auto_resolve_enabled: bool,
    pub allow_mutation: bool,
    pub reviewers: Vec<String>,
    pub policy: SeverityPolicy,
}

impl Default for ReviewLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            ci_wait: CiWaitOptions::default(),
            auto_resolve_enabled: true,
            allow_mutation: true,
            reviewers: Vec::new(),
            policy: SeverityPolicy::default(),
        }
    }
}

/// Mutable state threaded through the loop body, refreshed only from the
/// iteration reports it produces. Data dependencies between iterations go
/// through this value and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct ReviewIterationContext {
    pub iteration: u32,
    pub checkpoint_sha: Option<String>,
    /// Checkpoint SHA observed the last time CI failed; equal SHAs on the
    /// next failure mean no actionable diff, i.e. a flake.
    pub last_failed_sha: Option<String>,
    pub last_reviewer_request_key: Option<String>,
}

/// Per-iteration classifier output for one thread.
#[derive(Debug, Clone, Deserialize)]
struct ThreadClassification {
    thread_id: String,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    bucket: Option<CoarseBucket>,
    #[serde(default)]
    needs_context: bool,
    #[serde(default)]
    rationale: Option<String>,
}

/// The primary audit trail for why a run converged or stalled: recorded as a
/// step artifact every iteration regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IterationReport {
    pub iteration: u32,
    pub status: String,
    pub ci_state: Option<CiState>,
    pub ci_fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_sha: Option<String>,
    pub unresolved_threads: usize,
    pub actionable: usize,
    pub ignored: usize,
    pub auto_resolved: usize,
    /// Auto-resolve candidates that failed or were skipped and got folded
    /// back into the actionable set.
    pub auto_resolve_failed: usize,
    pub resolved_by_plan: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_request_key: Option<String>,
}

pub const STATUS_CONVERGED: &str = "converged";
pub const STATUS_CI_FLAKY: &str = "ci_flaky";
pub const STATUS_FIXES_APPLIED: &str = "fixes_applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewLoopExit {
    Converged,
    /// Iteration budget exhausted with review still open; not a failure.
    BudgetExhausted,
}

pub struct ReviewLoop<'a> {
    engine: &'a StepEngine,
    cognition: &'a dyn Cognition,
    provider: &'a dyn ReviewProvider,
    implementer: &'a dyn Implementer,
    runner: &'a dyn VerificationRunner,
    vcs: &'a dyn VersionControl,
    tracker: &'a dyn TaskTracker,
    worktree: &'a Path,
    pr: PrHandle,
    task_ref: Option<String>,
    cfg: ReviewLoopConfig,
}

impl<'a> ReviewLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &'a StepEngine,
        cognition: &'a dyn Cognition,
        provider: &'a dyn ReviewProvider,
        implementer: &'a dyn Implementer,
        runner: &'a dyn VerificationRunner,
        vcs: &'a dyn VersionControl,
        tracker: &'a dyn TaskTracker,
        worktree: &'a Path,
        pr: PrHandle,
        task_ref: Option<String>,
        cfg: ReviewLoopConfig,
    ) -> Self {
        Self {
            engine,
            cognition,
            provider,
            implementer,
            runner,
            vcs,
            tracker,
            worktree,
            pr,
            task_ref,
            cfg,
        }
    }

    fn run_id(&self) -> &str {
        self.engine.run_id()
    }

    /// Record why the loop stopped where a human can see it, then fail.
    fn block(&self, reason: impl Into<String>) -> AgentError {
        let reason = reason.into();
        tracing::warn!(run_id = %self.run_id(), %reason, "review loop blocked");
        let persisted = self.engine.store().update(self.run_id(), |doc| {
            doc.blocked_reason = Some(reason.clone());
        });
        if let Err(err) = persisted {
            return err;
        }
        AgentError::expected("review_loop_blocked", reason)
    }

    fn load_context(&self) -> AgentResult<ReviewIterationContext> {
        let doc = self.engine.store().load(self.run_id())?;
        let summary = doc.review.unwrap_or_default();
        Ok(ReviewIterationContext {
            iteration: summary.iterations,
            checkpoint_sha: summary.last_checkpoint_sha.clone(),
            last_failed_sha: if summary.last_ci.as_deref() == Some("failing") {
                summary.last_checkpoint_sha
            } else {
                None
            },
            last_reviewer_request_key: None,
        })
    }

    fn persist_summary(&self, ctx: &ReviewIterationContext, report: &IterationReport) -> AgentResult<()> {
        self.engine.store().update(self.run_id(), |doc| {
            let summary = doc.review.get_or_insert_with(ReviewSummary::default);
            summary.iterations = ctx.iteration;
            summary.pr_number = Some(self.pr.number);
            summary.last_checkpoint_sha = ctx.checkpoint_sha.clone();
            summary.last_ci = report.ci_state.map(|s| {
                match s {
                    CiState::Pending => "pending",
                    CiState::Passing => "passing",
                    CiState::Failing => "failing",
                }
                .to_string()
            });
            summary.converged = report.status == STATUS_CONVERGED;
        })
    }

    /// Drive review iterations until convergence or budget exhaustion.
    pub async fn run(&self) -> AgentResult<ReviewLoopExit> {
        let mut ctx = self.load_context()?;
        if ctx.iteration >= self.cfg.max_iterations {
            return Ok(ReviewLoopExit::BudgetExhausted);
        }

        while ctx.iteration < self.cfg.max_iterations {
            let iteration = ctx.iteration + 1;
            let step_id = format!("review.iteration.{iteration}");
            let snapshot = ctx.clone();
            let report: IterationReport = self
                .engine
                .run_step(
                    &step_id,
                    &format!("Review iteration {iteration}"),
                    StepOptions::with_inputs(serde_json::json!({
                        "iteration": iteration,
                        "pr": self.pr.number,
                        "checkpoint_sha": snapshot.checkpoint_sha.clone(),
                    })),
                    |handle| self.iterate(iteration, snapshot, handle),
                )
                .await?;

            Self::fold_report(&mut ctx, &report);
            self.persist_summary(&ctx, &report)?;

            if report.status == STATUS_CONVERGED {
                PhaseMachine::new(self.engine.store(), self.run_id())
                    .transition(Phase::Complete, Some("review_loop_clean"))?;
                if let Some(task_ref) = &self.task_ref {
                    self.tracker.complete_task(task_ref).await?;
                }
                return Ok(ReviewLoopExit::Converged);
            }
        }

        tracing::info!(
            run_id = %self.run_id(),
            max_iterations = self.cfg.max_iterations,
            "review loop budget exhausted, review still open"
        );
        Ok(ReviewLoopExit::BudgetExhausted)
    }

    /// Apply one iteration's report back onto the loop context. This is the
    /// only place iteration state is refreshed.
    fn fold_report(ctx: &mut ReviewIterationContext, report: &IterationReport) {
        ctx.iteration = report.iteration;
        if report.status == "ci_failed" || report.status == STATUS_CI_FLAKY {
            ctx.last_failed_sha = report.checkpoint_sha.clone();
        } else if report.checkpoint_sha.is_some() && report.checkpoint_sha != ctx.checkpoint_sha {
            // New code landed; a previous failure SHA no longer applies.
            ctx.last_failed_sha = None;
        }
        if report.checkpoint_sha.is_some() {
            ctx.checkpoint_sha = report.checkpoint_sha.clone();
        }
        if report.reviewer_request_key.is_some() {
            ctx.last_reviewer_request_key = report.reviewer_request_key.clone();
        }
    }

    async fn iterate(
        &self,
        iteration: u32,
        ctx: ReviewIterationContext,
        handle: StepHandle,
    ) -> AgentResult<IterationReport> {
        let mut report = IterationReport {
            iteration,
            ..Default::default()
        };
        let checkpoints = CheckpointManager::new(self.vcs, self.worktree);

        // 1. Wait for CI; heartbeats keep this step's lease fresh.
        let ci = wait_for_ci(self.provider, self.pr.number, &self.cfg.ci_wait, || {
            handle.heartbeat()
        })
        .await?;
        report.ci_state = Some(ci.state);

        if ci.state == CiState::Failing {
            let head = checkpoints.head_sha().await?;
            if ctx.last_failed_sha.as_deref() == Some(head.as_str()) {
                // Same checkpoint failed before: no actionable diff since the
                // last failure, so this is a flake, not a code-fix failure.
                report.status = STATUS_CI_FLAKY.to_string();
                report.checkpoint_sha = Some(head);
                handle.put_artifact("report", &report)?;
                tracing::warn!(run_id = %self.run_id(), iteration, "CI failure classified as flake");
                return Ok(report);
            }
            report.status = "ci_failed".to_string();
            report.checkpoint_sha = Some(head);
            let fixed_ci = self
                .fix_ci(&ci.failing_checks, &handle, &checkpoints, &mut report)
                .await?;
            report.ci_fixed = fixed_ci;
        }

        // 3. Fetch unresolved review threads.
        let threads = self.provider.fetch_unresolved_threads(self.pr.number).await?;
        handle.heartbeat()?;
        report.unresolved_threads = threads.len();

        if threads.is_empty() {
            report.status = STATUS_CONVERGED.to_string();
            handle.put_artifact("report", &report)?;
            return Ok(report);
        }

        // Fingerprint and classify; fingerprints are recomputed every
        // iteration, thread id is the only cross-iteration identity.
        let fingerprints: Vec<ThreadFingerprint> = threads.iter().map(fingerprint_thread).collect();
        let classified = self.classify(&fingerprints, &handle).await?;
        let mut partition = self.cfg.policy.partition(classified);
        report.ignored = partition.ignored.len();

        // 4. Auto-resolve; failures and skips fold back into actionable.
        let candidates = std::mem::take(&mut partition.auto_resolve);
        if self.cfg.auto_resolve_enabled && self.cfg.allow_mutation {
            for thread in candidates {
                match self.auto_resolve_thread(&thread).await {
                    Ok(()) => report.auto_resolved += 1,
                    Err(err) => {
                        tracing::warn!(
                            thread_id = %thread.fingerprint.thread_id,
                            error = %err,
                            "auto-resolve failed, escalating to actionable"
                        );
                        report.auto_resolve_failed += 1;
                        partition.actionable.push(thread);
                    }
                }
                handle.heartbeat()?;
            }
        } else {
            report.auto_resolve_failed += candidates.len();
            partition.actionable.extend(candidates);
        }
        report.actionable = partition.actionable.len();

        if partition.actionable.is_empty() {
            handle.put_artifact("report", &report)?;
            return Err(self.block("no actionable review fixes identified"));
        }

        // 5. Fetch full bodies only for threads flagged as needing context.
        let mut full_context: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        for thread in partition.actionable.iter().filter(|t| t.needs_context) {
            let full = self
                .provider
                .fetch_thread(&thread.fingerprint.thread_id)
                .await?;
            handle.heartbeat()?;
            full_context.insert(
                thread.fingerprint.thread_id.clone(),
                serde_json::to_value(&full)
                    .map_err(|e| AgentError::internal(e.to_string()))?,
            );
        }

        // 6. Plan, apply, verify, checkpoint.
        let plan: FixPlan = invoke_typed(
            self.cognition,
            CognitionRequest::new(
                "review_fix_plan",
                serde_json::json!({
                    "threads": partition.actionable,
                    "full_threads": full_context,
                }),
            ),
        )
        .await?;
        handle.heartbeat()?;
        self.implementer.apply_plan(&plan, self.worktree).await?;
        handle.heartbeat()?;

        let verification = self.runner.run(None, self.worktree).await?;
        handle.heartbeat()?;
        if !verification.ok {
            handle.put_artifact("report", &report)?;
            return Err(self.block(format!(
                "verification failed after review fixes: {}",
                verification.failing_names().join(", ")
            )));
        }

        let outcome = checkpoints
            .checkpoint(&format!("address review feedback (iteration {iteration})"), &[])
            .await?;
        report.checkpoint_sha = Some(outcome.sha.clone());
        checkpoints.push().await?;
        handle.heartbeat()?;

        // 7. Resolve what the plan claims to have addressed; re-request
        // reviewers only when the dedup key changed.
        for thread_id in &plan.resolved_thread_ids {
            match self.provider.resolve_thread(thread_id).await {
                Ok(()) => report.resolved_by_plan += 1,
                Err(err) => {
                    tracing::warn!(thread_id = %thread_id, error = %err, "failed to resolve thread")
                }
            }
        }
        if !self.cfg.reviewers.is_empty() {
            let key = digest_str(&format!(
                "{}|{}|{}",
                self.cfg.reviewers.join(","),
                self.pr.number,
                iteration
            ));
            if ctx.last_reviewer_request_key.as_deref() != Some(key.as_str()) {
                self.provider
                    .request_reviewers(self.pr.number, &self.cfg.reviewers)
                    .await?;
                report.reviewer_request_key = Some(key);
            } else {
                report.reviewer_request_key = ctx.last_reviewer_request_key.clone();
            }
        }

        if report.status.is_empty() || report.status == "ci_failed" {
            report.status = STATUS_FIXES_APPLIED.to_string();
        }

        // 8. The report is the audit trail; record it regardless of outcome.
        handle.put_artifact("report", &report)?;
        Ok(report)
    }

    /// CI-fix path: plan, apply, re-verify, checkpoint, push, re-poll. A
    /// second failure blocks the run; no further review work this iteration.
    async fn fix_ci(
        &self,
        failing_checks: &[String],
        handle: &StepHandle,
        checkpoints: &CheckpointManager<'_>,
        report: &mut IterationReport,
    ) -> AgentResult<bool> {
        tracing::info!(run_id = %self.run_id(), ?failing_checks, "CI failing, attempting fix");
        let plan: FixPlan = invoke_typed(
            self.cognition,
            CognitionRequest::new(
                "ci_fix_plan",
                serde_json::json!({ "failing_checks": failing_checks }),
            ),
        )
        .await?;
        handle.heartbeat()?;

        self.implementer.apply_plan(&plan, self.worktree).await?;
        handle.heartbeat()?;

        let verification = self.runner.run(None, self.worktree).await?;
        handle.heartbeat()?;
        if !verification.ok {
            handle.put_artifact("report", report)?;
            return Err(self.block(format!(
                "verification failed after CI fix: {}",
                verification.failing_names().join(", ")
            )));
        }

        let outcome = checkpoints.checkpoint("fix CI failures", &[]).await?;
        report.checkpoint_sha = Some(outcome.sha.clone());
        checkpoints.push().await?;

        let ci = wait_for_ci(self.provider, self.pr.number, &self.cfg.ci_wait, || {
            handle.heartbeat()
        })
        .await?;
        if ci.state == CiState::Failing {
            handle.put_artifact("report", report)?;
            return Err(self.block("CI still failing after fixes"));
        }
        // The report carries the state CI settled at, not the failure that
        // triggered the fix; a resumed run must not treat the first failure
        // of the freshly fixed code as a repeat at the same checkpoint.
        report.ci_state = Some(ci.state);
        Ok(true)
    }

    async fn classify(
        &self,
        fingerprints: &[ThreadFingerprint],
        handle: &StepHandle,
    ) -> AgentResult<Vec<ClassifiedThread>> {
        let classifications: Vec<ThreadClassification> = invoke_typed(
            self.cognition,
            CognitionRequest::new(
                "classify_review_threads",
                serde_json::json!({ "threads": fingerprints }),
            ),
        )
        .await?;
        handle.heartbeat()?;

        let mut by_id: BTreeMap<String, ThreadClassification> = classifications
            .into_iter()
            .map(|c| (c.thread_id.clone(), c))
            .collect();

        Ok(fingerprints
            .iter()
            .map(|fp| {
                let classification = by_id.remove(&fp.thread_id);
                let (severity, needs_context, rationale) = match classification {
                    Some(c) => {
                        let severity = c
                            .severity
                            .or_else(|| c.bucket.map(Severity::from_coarse_bucket))
                            // Unclassifiable threads stay in front of a human.
                            .unwrap_or(Severity::Question);
                        (severity, c.needs_context, c.rationale)
                    }
                    None => (Severity::Question, false, None),
                };
                ClassifiedThread {
                    fingerprint: fp.clone(),
                    severity,
                    needs_context,
                    rationale,
                }
            })
            .collect())
    }

    /// Acknowledge and resolve one thread, or fail so it escalates.
    async fn auto_resolve_thread(&self, thread: &ClassifiedThread) -> AgentResult<()> {
        if thread.fingerprint.is_outdated {
            return Err(AgentError::conflict("thread is outdated"));
        }
        let comment_id = thread
            .fingerprint
            .first_comment_id()
            .ok_or_else(|| AgentError::not_found("comment id on thread"))?;
        self.provider
            .reply_to_comment(
                comment_id,
                "Acknowledged; no code change needed. Resolving this thread.",
            )
            .await?;
        self.provider
            .resolve_thread(&thread.fingerprint.thread_id)
            .await
    }
}
