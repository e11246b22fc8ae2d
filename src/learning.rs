//! Learning confidence gate.
//!
//! After a run finishes, the agent may want to persist a learning note
//! (conventions, gotchas, repo-specific facts) into the repository. Whether
//! that note is committed is gated on historical evidence: how often applied
//! notes on this topic actually helped, adjusted by signals from the current
//! run. Below the confidence threshold the note is parked as pending instead
//! of silently dropped or blindly committed.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::collab::VersionControl;
use crate::errors::{AgentError, AgentResult};
use crate::state::model::LearningSummary;
use crate::state::store::RunStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    /// Always apply notes that pass the safety checks.
    Apply,
    /// Apply only above the confidence threshold.
    #[default]
    Auto,
    /// Record outcomes, never touch the repository.
    Off,
}

#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub mode: LearningMode,
    pub threshold: f64,
    pub allow_apply: bool,
    /// Below this many historical samples, confidence is discounted
    /// proportionally rather than trusted at face value.
    pub min_samples: u32,
    /// Path prefixes (relative to the worktree) a note may never touch.
    pub protected_paths: Vec<PathBuf>,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            mode: LearningMode::Auto,
            threshold: 0.6,
            allow_apply: true,
            min_samples: 5,
            protected_paths: vec![PathBuf::from(".git")],
        }
    }
}

/// A candidate note with the repository files it would modify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningNote {
    pub topic: String,
    pub summary: String,
    /// Files (relative to the worktree) the note has been written into.
    pub target_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoricalOutcome {
    pub applied: bool,
    pub succeeded: bool,
}

/// Evidence store for past learning outcomes, per topic.
pub trait LearningHistory: Send + Sync {
    fn outcomes(&self, topic: &str) -> AgentResult<Vec<HistoricalOutcome>>;
    fn record(&self, topic: &str, outcome: HistoricalOutcome) -> AgentResult<()>;
}

/// JSONL-backed history: one `{topic, applied, succeeded}` line per outcome.
pub struct FileLearningHistory {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryLine {
    topic: String,
    applied: bool,
    succeeded: bool,
}

impl FileLearningHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LearningHistory for FileLearningHistory {
    fn outcomes(&self, topic: &str) -> AgentResult<Vec<HistoricalOutcome>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| AgentError::internal(format!("failed to read learning history: {e}")))?;
        let mut outcomes = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: HistoryLine = serde_json::from_str(line).map_err(|e| {
                AgentError::validation(
                    "learning_history_shape",
                    format!("corrupt learning history line: {e}"),
                )
            })?;
            if parsed.topic == topic {
                outcomes.push(HistoricalOutcome {
                    applied: parsed.applied,
                    succeeded: parsed.succeeded,
                });
            }
        }
        Ok(outcomes)
    }

    fn record(&self, topic: &str, outcome: HistoricalOutcome) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::internal(format!("failed to create history dir: {e}")))?;
        }
        let line = serde_json::to_string(&HistoryLine {
            topic: topic.to_string(),
            applied: outcome.applied,
            succeeded: outcome.succeeded,
        })
        .map_err(|e| AgentError::internal(e.to_string()))?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgentError::internal(format!("failed to open learning history: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| AgentError::internal(format!("failed to append learning history: {e}")))?;
        Ok(())
    }
}

/// Signals from the run that just finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSignals {
    pub ci_passed: bool,
    pub unresolved_reviews: usize,
    /// Review converged without a single fix iteration.
    pub ship_it: bool,
}

/// Confidence that applying a note on this topic helps, in `[0, 1]`.
///
/// The base rate is the historical success rate of applied notes, discounted
/// by `n / max(n, min_samples)` so a single lucky sample cannot clear the
/// threshold. Current-run signals nudge the score, then it is clamped.
pub fn confidence_score(
    history: &[HistoricalOutcome],
    signals: RunSignals,
    min_samples: u32,
) -> f64 {
    let applied: Vec<_> = history.iter().filter(|o| o.applied).collect();
    let n = applied.len() as f64;
    let base = if applied.is_empty() {
        0.0
    } else {
        let successes = applied.iter().filter(|o| o.succeeded).count() as f64;
        let weight = n / n.max(f64::from(min_samples.max(1)));
        (successes / n) * weight
    };

    let mut score = base;
    if signals.ci_passed {
        score += 0.1;
    }
    if signals.ship_it {
        score += 0.1;
    }
    score -= 0.05 * signals.unresolved_reviews as f64;
    score.clamp(0.0, 1.0)
}

/// Whether every target file is a plain relative path inside the worktree and
/// outside the protected prefixes.
pub fn targets_are_safe(targets: &[PathBuf], protected: &[PathBuf]) -> bool {
    if targets.is_empty() {
        return false;
    }
    targets.iter().all(|path| {
        if path.as_os_str().is_empty() || path.is_absolute() {
            return false;
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return false;
        }
        !protected.iter().any(|p| path.starts_with(p))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum GateDecision {
    /// Outcome recorded; learning is off for this run.
    Recorded,
    /// Parked: the note stays out of the repo until a human or more evidence
    /// moves it.
    Pending { reason: String },
    /// Committed to the repository.
    Applied { sha: String },
}

pub struct LearningGate<'a> {
    store: &'a RunStateStore,
    run_id: &'a str,
    history: &'a dyn LearningHistory,
    vcs: &'a dyn VersionControl,
    worktree: &'a Path,
    config: LearningConfig,
}

impl<'a> LearningGate<'a> {
    pub fn new(
        store: &'a RunStateStore,
        run_id: &'a str,
        history: &'a dyn LearningHistory,
        vcs: &'a dyn VersionControl,
        worktree: &'a Path,
        config: LearningConfig,
    ) -> Self {
        Self {
            store,
            run_id,
            history,
            vcs,
            worktree,
            config,
        }
    }

    /// Run the decision table for `note` and persist the outcome on the run
    /// document. Commits stage only the note's own files, never the whole
    /// worktree.
    pub async fn decide_and_apply(
        &self,
        note: &LearningNote,
        signals: RunSignals,
    ) -> AgentResult<GateDecision> {
        let outcomes = self.history.outcomes(&note.topic)?;
        let confidence = confidence_score(&outcomes, signals, self.config.min_samples);

        let decision = if self.config.mode == LearningMode::Off {
            GateDecision::Recorded
        } else if self.config.mode == LearningMode::Auto && confidence < self.config.threshold {
            GateDecision::Pending {
                reason: "below_threshold".to_string(),
            }
        } else if !self.config.allow_apply {
            GateDecision::Pending {
                reason: "apply_disabled".to_string(),
            }
        } else if !targets_are_safe(&note.target_files, &self.config.protected_paths) {
            GateDecision::Pending {
                reason: "unsafe_targets".to_string(),
            }
        } else {
            let manager = CheckpointManager::new(self.vcs, self.worktree);
            let outcome = manager
                .checkpoint(
                    &format!("record learning note: {}", note.topic),
                    &note.target_files,
                )
                .await?;
            GateDecision::Applied { sha: outcome.sha }
        };

        let committed = matches!(decision, GateDecision::Applied { .. });
        self.history.record(
            &note.topic,
            HistoricalOutcome {
                applied: committed,
                succeeded: signals.ci_passed && signals.unresolved_reviews == 0,
            },
        )?;

        let summary = LearningSummary {
            status: match &decision {
                GateDecision::Recorded => "recorded".to_string(),
                GateDecision::Pending { .. } => "pending".to_string(),
                GateDecision::Applied { .. } => "applied".to_string(),
            },
            reason: match &decision {
                GateDecision::Pending { reason } => Some(reason.clone()),
                _ => None,
            },
            confidence,
            threshold: self.config.threshold,
            committed,
            at: Utc::now(),
        };
        self.store.update(self.run_id, |doc| {
            doc.learning = Some(summary.clone());
        })?;
        tracing::info!(
            run_id = %self.run_id,
            topic = %note.topic,
            confidence,
            status = ?decision,
            "learning gate decision"
        );
        Ok(decision)
    }
}
