//! Persisted run-state model.
//!
//! One [`RunDocument`] per run id holds the run record, the step ledger and
//! the artifacts index, plus typed orchestrator sections (plan, checkpoints,
//! review/learning summaries). The document carries a `schema_version` that is
//! validated on read; unknown versions are rejected explicitly instead of
//! being shape-checked at every access site.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AgentError;
use crate::phase::Phase;

/// Current document schema version. Bump on any incompatible shape change.
pub const SCHEMA_VERSION: u32 = 1;

/// A running step whose lease has not been refreshed within this window is
/// considered crashed.
pub const LEASE_STALENESS: Duration = Duration::seconds(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Canceled,
    Failed,
    Success,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Canceled => "canceled",
            RunStatus::Failed => "failed",
            RunStatus::Success => "success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub phase: Phase,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Running,
            phase: Phase::Idle,
            attempt: 1,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    Running,
    Done,
    Failed,
}

/// A time-stamped claim of liveness on a running step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            lease_id: Uuid::new_v4(),
            started_at: now,
            heartbeat_at: now,
        }
    }

    pub fn beat(&mut self) {
        self.heartbeat_at = Utc::now();
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.heartbeat_at > LEASE_STALENESS
    }
}

impl Default for Lease {
    fn default() -> Self {
        Self::new()
    }
}

/// Locator for a durably stored artifact, relative to the artifacts root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub locator: String,
}

/// Structured error persisted on a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&AgentError> for ErrorRecord {
    fn from(err: &AgentError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// One named unit of work within a run. Created lazily, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_digest: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Invariant: present whenever `status == Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

/// Persisted plan summary produced in the plan phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub task_ref: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// One atomic version-control checkpoint made after a mutating step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sha: String,
    pub message: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Rolling review-loop summary kept on the document for inspection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewSummary {
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ci: Option<String>,
    pub converged: bool,
}

/// Verification auto-fix bookkeeping: attempt count plus per-attempt records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationSummary {
    pub attempts: u32,
    #[serde(default)]
    pub records: Vec<AutoFixRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFixOutcome {
    Planned,
    Applied,
    Succeeded,
    Failed,
}

/// Audit record of one auto-fix attempt, persisted regardless of result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixRecord {
    pub attempt: u32,
    pub outcome: AutoFixOutcome,
    pub failures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_added: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_removed: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Outcome of the learning confidence gate for this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSummary {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub confidence: f64,
    pub threshold: f64,
    pub committed: bool,
    pub at: DateTime<Utc>,
}

/// The durable per-run document. All mutation goes through
/// [`RunStateStore::update`](crate::state::store::RunStateStore::update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub schema_version: u32,
    pub run: RunRecord,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    /// Transient pointer to the step currently executing, for crash diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning: Option<LearningSummary>,
    /// Why the run stopped, if it stopped somewhere a human should look.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl RunDocument {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run: RunRecord::new(run_id),
            steps: BTreeMap::new(),
            current_step: None,
            plan: None,
            checkpoints: Vec::new(),
            review: None,
            verification: None,
            learning: None,
            blocked_reason: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    /// Get or lazily create the record for `step_id`.
    pub fn step_mut(&mut self, step_id: &str) -> &mut StepRecord {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Step ids currently marked running whose lease is stale (or missing,
    /// which violates the running-implies-lease invariant) as of `now`.
    pub fn stale_running_steps(&self, now: DateTime<Utc>) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(_, rec)| rec.status == StepStatus::Running)
            .filter(|(_, rec)| rec.lease.as_ref().is_none_or(|l| l.is_stale(now)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_is_not_stale() {
        let lease = Lease::new();
        assert!(!lease.is_stale(Utc::now()));
    }

    #[test]
    fn lease_staleness_window_is_two_minutes() {
        let mut lease = Lease::new();
        lease.heartbeat_at = Utc::now() - Duration::seconds(119);
        assert!(!lease.is_stale(Utc::now()));
        lease.heartbeat_at = Utc::now() - Duration::seconds(121);
        assert!(lease.is_stale(Utc::now()));
    }

    #[test]
    fn beat_refreshes_heartbeat() {
        let mut lease = Lease::new();
        lease.heartbeat_at = Utc::now() - Duration::seconds(600);
        assert!(lease.is_stale(Utc::now()));
        lease.beat();
        assert!(!lease.is_stale(Utc::now()));
    }

    #[test]
    fn stale_running_steps_finds_stale_and_leaseless() {
        let mut doc = RunDocument::new("r1");
        let now = Utc::now();

        let fresh = doc.step_mut("fresh");
        fresh.status = StepStatus::Running;
        fresh.lease = Some(Lease::new());

        let stale = doc.step_mut("stale");
        stale.status = StepStatus::Running;
        let mut old = Lease::new();
        old.heartbeat_at = now - Duration::seconds(300);
        stale.lease = Some(old);

        // Running without a lease violates the invariant and counts as stale.
        doc.step_mut("leaseless").status = StepStatus::Running;

        doc.step_mut("done").status = StepStatus::Done;

        let mut ids = doc.stale_running_steps(now);
        ids.sort();
        assert_eq!(ids, vec!["leaseless".to_string(), "stale".to_string()]);
    }

    #[test]
    fn document_roundtrips_through_json() {
        let mut doc = RunDocument::new("r1");
        doc.run.phase = Phase::Verify;
        let step = doc.step_mut("verify.run");
        step.status = StepStatus::Done;
        step.title = "Run verification".to_string();
        step.artifacts.insert(
            "output".to_string(),
            ArtifactRef {
                locator: "r1/verify.run/output.json".to_string(),
            },
        );

        let json = serde_json::to_string(&doc).unwrap();
        let back: RunDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.schema_version, SCHEMA_VERSION);
        assert_eq!(back.run.phase, Phase::Verify);
        assert_eq!(back.step("verify.run").unwrap().status, StepStatus::Done);
        assert_eq!(back.step("verify.run").unwrap().artifacts.len(), 1);
    }

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
    }
}
