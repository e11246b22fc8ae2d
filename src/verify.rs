//! Verification auto-fix loop.
//!
//! Given failing verification commands, decide whether an automated
//! fix-and-reverify cycle is worth attempting, drive it, and record every
//! attempt's outcome so later attempts and the caller's triage have full
//! context. Failures are only auto-fixed when every failing command name
//! matches a known tag; unclassified failures are escalated, never guessed at.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::collab::{
    invoke_typed, Cognition, CognitionRequest, FixPlan, Implementer, VerificationOutcome,
    VerificationRunner, VersionControl,
};
use crate::errors::AgentResult;
use crate::state::model::{AutoFixOutcome, AutoFixRecord, VerificationSummary};
use crate::state::store::RunStateStore;
use crate::util::excerpt;

/// Failure-name tags the loop recognizes as automatically fixable.
pub const KNOWN_FAILURE_TAGS: &[&str] = &["lint", "test", "type", "check", "build", "format"];

const FAILURE_EXCERPT_LEN: usize = 400;

pub fn is_classified_failure(name: &str) -> bool {
    let lower = name.to_lowercase();
    KNOWN_FAILURE_TAGS.iter().any(|tag| lower.contains(tag))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureClassification {
    pub classified: bool,
    pub matched: Vec<String>,
    pub unmatched: Vec<String>,
}

/// Classify failing command names. `classified` holds only when every name
/// matches a known tag.
pub fn classify_failures(names: &[String]) -> FailureClassification {
    let (matched, unmatched): (Vec<String>, Vec<String>) = names
        .iter()
        .cloned()
        .partition(|n| is_classified_failure(n));
    FailureClassification {
        classified: unmatched.is_empty() && !matched.is_empty(),
        matched,
        unmatched,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutoFixContext {
    pub enabled: bool,
    pub dry_run: bool,
    pub allow_mutation: bool,
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoFixDecision {
    pub attempt: bool,
    pub reason: &'static str,
}

/// Gate for the automated fix cycle.
pub fn should_attempt_auto_fix(ctx: &AutoFixContext, failures: &[String]) -> AutoFixDecision {
    if !ctx.enabled {
        return AutoFixDecision {
            attempt: false,
            reason: "disabled",
        };
    }
    if ctx.dry_run {
        return AutoFixDecision {
            attempt: false,
            reason: "dry_run",
        };
    }
    if !ctx.allow_mutation {
        return AutoFixDecision {
            attempt: false,
            reason: "mutation_not_allowed",
        };
    }
    if ctx.attempts >= ctx.max_attempts {
        return AutoFixDecision {
            attempt: false,
            reason: "attempts_exhausted",
        };
    }
    if !classify_failures(failures).classified {
        return AutoFixDecision {
            attempt: false,
            reason: "unclassified_failures",
        };
    }
    AutoFixDecision {
        attempt: true,
        reason: "classified",
    }
}

/// What to do with failures the loop could not (or should not) fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageDecision {
    pub classified: bool,
    pub ask_user: bool,
    /// Commands to re-run for classified failures.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Deterministic triage for classified failures: re-run exactly the failed
/// commands. Unclassified failures ask the user.
pub fn triage_failures(failures: &[String]) -> TriageDecision {
    let classification = classify_failures(failures);
    if classification.classified {
        TriageDecision {
            classified: true,
            ask_user: false,
            commands: failures.to_vec(),
            note: None,
        }
    } else {
        TriageDecision {
            classified: false,
            ask_user: true,
            commands: Vec::new(),
            note: Some(format!(
                "unrecognized verification failures: {}",
                classification.unmatched.join(", ")
            )),
        }
    }
}

/// AI-produced next step for unclassified failures in apply mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStepDecision {
    pub action: NextStepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStepAction {
    Retry,
    AskUser,
}

#[derive(Debug, Clone, Copy)]
pub struct AutoFixSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub dry_run: bool,
    pub allow_mutation: bool,
}

impl Default for AutoFixSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            dry_run: false,
            allow_mutation: true,
        }
    }
}

/// Result of one pass through the auto-fix loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixReport {
    pub attempted: bool,
    pub fixed: bool,
    pub decision_reason: String,
    #[serde(default)]
    pub remaining: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage: Option<TriageDecision>,
}

pub struct VerificationAutoFix<'a> {
    store: &'a RunStateStore,
    run_id: &'a str,
    cognition: &'a dyn Cognition,
    implementer: &'a dyn Implementer,
    runner: &'a dyn VerificationRunner,
    vcs: &'a dyn VersionControl,
    worktree: &'a Path,
    settings: AutoFixSettings,
}

impl<'a> VerificationAutoFix<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a RunStateStore,
        run_id: &'a str,
        cognition: &'a dyn Cognition,
        implementer: &'a dyn Implementer,
        runner: &'a dyn VerificationRunner,
        vcs: &'a dyn VersionControl,
        worktree: &'a Path,
        settings: AutoFixSettings,
    ) -> Self {
        Self {
            store,
            run_id,
            cognition,
            implementer,
            runner,
            vcs,
            worktree,
            settings,
        }
    }

    fn attempts_so_far(&self) -> AgentResult<u32> {
        Ok(self
            .store
            .load(self.run_id)?
            .verification
            .map(|v| v.attempts)
            .unwrap_or(0))
    }

    fn persist_record(&self, record: AutoFixRecord, bump_attempts: bool) -> AgentResult<()> {
        self.store.update(self.run_id, |doc| {
            let summary = doc
                .verification
                .get_or_insert_with(VerificationSummary::default);
            if bump_attempts {
                summary.attempts += 1;
            }
            summary.records.push(record);
        })
    }

    fn amend_last_record(
        &self,
        mutate: impl FnOnce(&mut AutoFixRecord),
    ) -> AgentResult<()> {
        self.store.update(self.run_id, |doc| {
            if let Some(summary) = doc.verification.as_mut()
                && let Some(last) = summary.records.last_mut()
            {
                mutate(last);
            }
        })
    }

    async fn fallback_triage(&self, failures: &[String]) -> AgentResult<TriageDecision> {
        let classification = classify_failures(failures);
        if classification.classified {
            // Known failure patterns get the deterministic path; no AI call.
            return Ok(triage_failures(failures));
        }
        if self.settings.allow_mutation && !self.settings.dry_run {
            let decision: NextStepDecision = invoke_typed(
                self.cognition,
                CognitionRequest::new(
                    "verification_next_step",
                    serde_json::json!({ "failures": failures }),
                ),
            )
            .await?;
            return Ok(TriageDecision {
                classified: false,
                ask_user: decision.action == NextStepAction::AskUser,
                commands: if decision.action == NextStepAction::Retry {
                    failures.to_vec()
                } else {
                    Vec::new()
                },
                note: decision.note,
            });
        }
        Ok(triage_failures(failures))
    }

    /// Handle a failing verification outcome: maybe fix, re-verify, record.
    ///
    /// `on_tick` runs around each external await so the wrapping step's lease
    /// stays fresh across long AI or subprocess calls.
    pub async fn handle_failures(
        &self,
        outcome: &VerificationOutcome,
        mut on_tick: impl FnMut() -> AgentResult<()>,
    ) -> AgentResult<AutoFixReport> {
        let failures = outcome.failing_names();
        let attempts = self.attempts_so_far()?;
        let decision = should_attempt_auto_fix(
            &AutoFixContext {
                enabled: self.settings.enabled,
                dry_run: self.settings.dry_run,
                allow_mutation: self.settings.allow_mutation,
                attempts,
                max_attempts: self.settings.max_attempts,
            },
            &failures,
        );

        if !decision.attempt {
            tracing::info!(reason = decision.reason, ?failures, "auto-fix skipped");
            let triage = self.fallback_triage(&failures).await?;
            return Ok(AutoFixReport {
                attempted: false,
                fixed: false,
                decision_reason: decision.reason.to_string(),
                remaining: failures,
                triage: Some(triage),
            });
        }

        let attempt = attempts + 1;
        tracing::info!(attempt, ?failures, "attempting verification auto-fix");

        let failure_context: Vec<serde_json::Value> = outcome
            .results
            .iter()
            .filter(|r| !r.passed())
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "exit_code": r.exit_code,
                    "stdout": excerpt(&r.stdout, FAILURE_EXCERPT_LEN),
                    "stderr": excerpt(&r.stderr, FAILURE_EXCERPT_LEN),
                })
            })
            .collect();

        on_tick()?;
        let plan: FixPlan = invoke_typed(
            self.cognition,
            CognitionRequest::new(
                "verification_fix_plan",
                serde_json::json!({ "failures": failure_context }),
            ),
        )
        .await?;

        self.persist_record(
            AutoFixRecord {
                attempt,
                outcome: AutoFixOutcome::Planned,
                failures: failures.clone(),
                files_changed: None,
                lines_added: None,
                lines_removed: None,
                at: chrono::Utc::now(),
            },
            true,
        )?;

        let checkpoints = CheckpointManager::new(self.vcs, self.worktree);
        let before_sha = checkpoints.head_sha().await?;

        on_tick()?;
        self.implementer.apply_plan(&plan, self.worktree).await?;
        self.amend_last_record(|r| r.outcome = AutoFixOutcome::Applied)?;

        // Before/after diff stats for the audit record.
        let stats = checkpoints.diff_stats(&before_sha).await?;
        self.amend_last_record(|r| {
            r.files_changed = Some(stats.files_changed);
            r.lines_added = Some(stats.lines_added);
            r.lines_removed = Some(stats.lines_removed);
        })?;

        on_tick()?;
        let reverify = self.runner.run(Some(&failures), self.worktree).await?;
        let fixed = reverify.ok;
        self.amend_last_record(|r| {
            r.outcome = if fixed {
                AutoFixOutcome::Succeeded
            } else {
                AutoFixOutcome::Failed
            };
        })?;

        if fixed {
            tracing::info!(attempt, "auto-fix succeeded");
            return Ok(AutoFixReport {
                attempted: true,
                fixed: true,
                decision_reason: decision.reason.to_string(),
                remaining: Vec::new(),
                triage: None,
            });
        }

        let remaining = reverify.failing_names();
        tracing::warn!(attempt, ?remaining, "auto-fix did not resolve all failures");
        let triage = self.fallback_triage(&remaining).await?;
        Ok(AutoFixReport {
            attempted: true,
            fixed: false,
            decision_reason: decision.reason.to_string(),
            remaining,
            triage: Some(triage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ApplyReport, CommandResult, ExecOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn known_tags_classify() {
        let c = classify_failures(&names(&["lint", "test"]));
        assert!(c.classified);
        assert_eq!(c.matched.len(), 2);
        assert!(c.unmatched.is_empty());
    }

    #[test]
    fn unknown_name_defeats_classification() {
        let c = classify_failures(&names(&["deploy-step"]));
        assert!(!c.classified);
        assert_eq!(c.unmatched, names(&["deploy-step"]));
    }

    #[test]
    fn mixed_names_are_unclassified() {
        let c = classify_failures(&names(&["lint", "deploy-step"]));
        assert!(!c.classified);
        assert_eq!(c.matched, names(&["lint"]));
    }

    #[test]
    fn tag_matching_is_substring_and_case_insensitive() {
        assert!(is_classified_failure("Typecheck"));
        assert!(is_classified_failure("cargo-build"));
        assert!(!is_classified_failure("deploy"));
    }

    #[test]
    fn gate_never_attempts_past_max_attempts() {
        for attempts in 0..10u32 {
            let decision = should_attempt_auto_fix(
                &AutoFixContext {
                    enabled: true,
                    dry_run: false,
                    allow_mutation: true,
                    attempts,
                    max_attempts: 3,
                },
                &names(&["lint"]),
            );
            assert_eq!(decision.attempt, attempts < 3, "attempts={attempts}");
            if attempts >= 3 {
                assert_eq!(decision.reason, "attempts_exhausted");
            }
        }
    }

    #[test]
    fn gate_respects_flags_in_order() {
        let base = AutoFixContext {
            enabled: true,
            dry_run: false,
            allow_mutation: true,
            attempts: 0,
            max_attempts: 2,
        };
        let failures = names(&["test"]);

        let d = should_attempt_auto_fix(&AutoFixContext { enabled: false, ..base }, &failures);
        assert_eq!(d.reason, "disabled");
        let d = should_attempt_auto_fix(&AutoFixContext { dry_run: true, ..base }, &failures);
        assert_eq!(d.reason, "dry_run");
        let d = should_attempt_auto_fix(
            &AutoFixContext { allow_mutation: false, ..base },
            &failures,
        );
        assert_eq!(d.reason, "mutation_not_allowed");
        let d = should_attempt_auto_fix(&base, &names(&["deploy-step"]));
        assert_eq!(d.reason, "unclassified_failures");
        assert!(!d.attempt);
        let d = should_attempt_auto_fix(&base, &failures);
        assert!(d.attempt);
    }

    #[test]
    fn triage_classified_reruns_failed_commands() {
        let t = triage_failures(&names(&["lint", "test"]));
        assert!(t.classified);
        assert!(!t.ask_user);
        assert_eq!(t.commands, names(&["lint", "test"]));
    }

    #[test]
    fn triage_unclassified_asks_user() {
        let t = triage_failures(&names(&["deploy-step"]));
        assert!(!t.classified);
        assert!(t.ask_user);
        assert!(t.commands.is_empty());
        assert!(t.note.unwrap().contains("deploy-step"));
    }

    // -- async loop tests ---------------------------------------------------

    struct PlanCognition;

    #[async_trait]
    impl Cognition for PlanCognition {
        async fn invoke(&self, request: CognitionRequest) -> AgentResult<serde_json::Value> {
            match request.intent.as_str() {
                "verification_fix_plan" => Ok(serde_json::json!({
                    "summary": "fix lint findings",
                    "steps": ["apply rustfmt"],
                })),
                "verification_next_step" => Ok(serde_json::json!({
                    "action": "ask_user",
                    "note": "unknown failure",
                })),
                other => panic!("unexpected intent {other}"),
            }
        }
    }

    struct CountingImplementer(AtomicU32);

    #[async_trait]
    impl Implementer for CountingImplementer {
        async fn apply_plan(&self, _plan: &FixPlan, _cwd: &Path) -> AgentResult<ApplyReport> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ApplyReport::default())
        }
    }

    /// Verification runner that fails `failures_before_pass` times, then passes.
    struct SequenceRunner {
        calls: AtomicU32,
        failures_before_pass: u32,
    }

    #[async_trait]
    impl VerificationRunner for SequenceRunner {
        async fn run(
            &self,
            selected: Option<&[String]>,
            _cwd: &Path,
        ) -> AgentResult<VerificationOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let pass = call >= self.failures_before_pass;
            let name = selected
                .and_then(|s| s.first().cloned())
                .unwrap_or_else(|| "lint".to_string());
            Ok(VerificationOutcome {
                ok: pass,
                results: vec![CommandResult {
                    name,
                    exit_code: if pass { 0 } else { 1 },
                    stdout: String::new(),
                    stderr: "error".to_string(),
                }],
            })
        }
    }

    /// Scripted VCS for head-sha and numstat probes.
    struct ScriptedVcs;

    #[async_trait]
    impl VersionControl for ScriptedVcs {
        async fn run(&self, args: &[&str], _cwd: &Path) -> AgentResult<ExecOutput> {
            let stdout = match args.first().copied() {
                Some("rev-parse") => "a".repeat(40),
                Some("diff") => "3\t1\tsrc/lib.rs\n".to_string(),
                _ => String::new(),
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    fn failing_outcome(name: &str) -> VerificationOutcome {
        VerificationOutcome {
            ok: false,
            results: vec![CommandResult {
                name: name.to_string(),
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn successful_fix_records_succeeded_attempt() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path()).unwrap();
        store.create_run("r1").unwrap();

        let implementer = CountingImplementer(AtomicU32::new(0));
        let runner = SequenceRunner {
            calls: AtomicU32::new(0),
            failures_before_pass: 0,
        };
        let vcs = ScriptedVcs;
        let loop_ = VerificationAutoFix::new(
            &store,
            "r1",
            &PlanCognition,
            &implementer,
            &runner,
            &vcs,
            dir.path(),
            AutoFixSettings::default(),
        );

        let report = loop_
            .handle_failures(&failing_outcome("lint"), || Ok(()))
            .await
            .unwrap();
        assert!(report.attempted);
        assert!(report.fixed);
        assert_eq!(implementer.0.load(Ordering::SeqCst), 1);

        let summary = store.load("r1").unwrap().verification.unwrap();
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].outcome, AutoFixOutcome::Succeeded);
        assert_eq!(summary.records[0].files_changed, Some(1));
        assert_eq!(summary.records[0].lines_added, Some(3));
    }

    #[tokio::test]
    async fn failed_fix_records_failed_and_triages_deterministically() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path()).unwrap();
        store.create_run("r1").unwrap();

        let implementer = CountingImplementer(AtomicU32::new(0));
        let runner = SequenceRunner {
            calls: AtomicU32::new(0),
            failures_before_pass: 99,
        };
        let vcs = ScriptedVcs;
        let loop_ = VerificationAutoFix::new(
            &store,
            "r1",
            &PlanCognition,
            &implementer,
            &runner,
            &vcs,
            dir.path(),
            AutoFixSettings::default(),
        );

        let report = loop_
            .handle_failures(&failing_outcome("test"), || Ok(()))
            .await
            .unwrap();
        assert!(report.attempted);
        assert!(!report.fixed);
        let triage = report.triage.unwrap();
        assert!(triage.classified);
        assert!(!triage.ask_user);
        assert_eq!(triage.commands, vec!["test".to_string()]);

        let summary = store.load("r1").unwrap().verification.unwrap();
        assert_eq!(summary.records[0].outcome, AutoFixOutcome::Failed);
    }

    #[tokio::test]
    async fn unclassified_failures_skip_fix_and_ask_ai() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path()).unwrap();
        store.create_run("r1").unwrap();

        let implementer = CountingImplementer(AtomicU32::new(0));
        let runner = SequenceRunner {
            calls: AtomicU32::new(0),
            failures_before_pass: 0,
        };
        let vcs = ScriptedVcs;
        let loop_ = VerificationAutoFix::new(
            &store,
            "r1",
            &PlanCognition,
            &implementer,
            &runner,
            &vcs,
            dir.path(),
            AutoFixSettings::default(),
        );

        let report = loop_
            .handle_failures(&failing_outcome("deploy-step"), || Ok(()))
            .await
            .unwrap();
        assert!(!report.attempted);
        assert_eq!(report.decision_reason, "unclassified_failures");
        assert_eq!(implementer.0.load(Ordering::SeqCst), 0);
        let triage = report.triage.unwrap();
        assert!(triage.ask_user);
    }

    #[tokio::test]
    async fn attempts_are_bounded_across_calls() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path()).unwrap();
        store.create_run("r1").unwrap();

        let implementer = CountingImplementer(AtomicU32::new(0));
        let runner = SequenceRunner {
            calls: AtomicU32::new(0),
            failures_before_pass: 99,
        };
        let vcs = ScriptedVcs;
        let settings = AutoFixSettings {
            max_attempts: 2,
            ..Default::default()
        };
        let loop_ = VerificationAutoFix::new(
            &store,
            "r1",
            &PlanCognition,
            &implementer,
            &runner,
            &vcs,
            dir.path(),
            settings,
        );

        for _ in 0..2 {
            let report = loop_
                .handle_failures(&failing_outcome("lint"), || Ok(()))
                .await
                .unwrap();
            assert!(report.attempted);
        }
        let report = loop_
            .handle_failures(&failing_outcome("lint"), || Ok(()))
            .await
            .unwrap();
        assert!(!report.attempted);
        assert_eq!(report.decision_reason, "attempts_exhausted");
        assert_eq!(implementer.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn on_tick_failure_aborts_before_ai_call() {
        let dir = tempdir().unwrap();
        let store = RunStateStore::new(dir.path()).unwrap();
        store.create_run("r1").unwrap();

        let implementer = CountingImplementer(AtomicU32::new(0));
        let runner = SequenceRunner {
            calls: AtomicU32::new(0),
            failures_before_pass: 0,
        };
        let vcs = ScriptedVcs;
        let loop_ = VerificationAutoFix::new(
            &store,
            "r1",
            &PlanCognition,
            &implementer,
            &runner,
            &vcs,
            dir.path(),
            AutoFixSettings::default(),
        );

        let ticks = Mutex::new(0u32);
        let err = loop_
            .handle_failures(&failing_outcome("lint"), || {
                let mut t = ticks.lock().unwrap();
                *t += 1;
                Err(crate::errors::AgentError::conflict("lease lost"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        assert_eq!(implementer.0.load(Ordering::SeqCst), 0);
    }
}
