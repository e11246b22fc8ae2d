//! End-to-end runs over mock collaborators: full pipeline with review
//! feedback, crash-resume without repeated side effects, and the learning
//! gate observed from outside the crate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use conductor::collab::{
    ApplyReport, CiResult, CiState, Cognition, CognitionRequest, CommandResult, ExecOutput,
    FixPlan, Implementer, NoopTracker, PrHandle, PrSpec, ReviewProvider, ReviewThread,
    ThreadComment, VerificationOutcome, VerificationRunner, VersionControl,
};
use conductor::controller::{Collaborators, RunController};
use conductor::engine::{StepEngine, StepOptions};
use conductor::errors::AgentResult;
use conductor::learning::{HistoricalOutcome, LearningHistory};
use conductor::state::model::{Lease, PlanSummary, RunStatus, StepStatus};
use conductor::state::RunEvent;
use conductor::{Phase, RunConfig, RunStateStore};

/// Cognition keyed by intent, with per-intent invocation counts.
struct ScriptedCognition {
    responses: HashMap<&'static str, serde_json::Value>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedCognition {
    fn new(responses: Vec<(&'static str, serde_json::Value)>) -> Self {
        Self {
            responses: responses.into_iter().collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, intent: &str) -> u32 {
        *self.calls.lock().unwrap().get(intent).unwrap_or(&0)
    }
}

#[async_trait]
impl Cognition for ScriptedCognition {
    async fn invoke(&self, request: CognitionRequest) -> AgentResult<serde_json::Value> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.intent.clone())
            .or_insert(0) += 1;
        self.responses
            .get(request.intent.as_str())
            .cloned()
            .ok_or_else(|| panic!("unexpected intent {}", request.intent))
    }
}

struct CountingImplementer {
    applied: Mutex<u32>,
}

#[async_trait]
impl Implementer for CountingImplementer {
    async fn apply_plan(&self, _plan: &FixPlan, _cwd: &Path) -> AgentResult<ApplyReport> {
        *self.applied.lock().unwrap() += 1;
        Ok(ApplyReport {
            files_changed: vec!["src/lib.rs".to_string()],
            notes: None,
        })
    }
}

struct PassingRunner;

#[async_trait]
impl VerificationRunner for PassingRunner {
    async fn run(
        &self,
        _selected: Option<&[String]>,
        _cwd: &Path,
    ) -> AgentResult<VerificationOutcome> {
        Ok(VerificationOutcome {
            ok: true,
            results: vec![CommandResult {
                name: "test".to_string(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }],
        })
    }
}

/// Git stand-in: monotonically advancing SHAs, always has staged content.
struct FakeVcs {
    commits: Mutex<u32>,
}

impl FakeVcs {
    fn new() -> Self {
        Self {
            commits: Mutex::new(0),
        }
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn run(&self, args: &[&str], _cwd: &Path) -> AgentResult<ExecOutput> {
        let (stdout, code) = match args {
            ["rev-parse", "HEAD"] => (format!("sha-{}", *self.commits.lock().unwrap()), 0),
            ["diff", "--cached", "--quiet"] => (String::new(), 1),
            ["commit", ..] => {
                *self.commits.lock().unwrap() += 1;
                (String::new(), 0)
            }
            _ => (String::new(), 0),
        };
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: code,
        })
    }
}

/// Review provider scripted with successive unresolved-thread snapshots.
struct ScriptedProvider {
    threads: Mutex<Vec<Vec<ReviewThread>>>,
    resolved: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(threads: Vec<Vec<ReviewThread>>) -> Self {
        Self {
            threads: Mutex::new(threads),
            resolved: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReviewProvider for ScriptedProvider {
    async fn check_ci(&self, _pr: u64) -> AgentResult<CiResult> {
        Ok(CiResult {
            state: CiState::Passing,
            failing_checks: vec![],
            url: None,
        })
    }
    async fn fetch_unresolved_threads(&self, _pr: u64) -> AgentResult<Vec<ReviewThread>> {
        let mut queue = self.threads.lock().unwrap();
        if queue.is_empty() {
            Ok(vec![])
        } else {
            Ok(queue.remove(0))
        }
    }
    async fn fetch_thread(&self, thread_id: &str) -> AgentResult<ReviewThread> {
        Ok(ReviewThread {
            id: thread_id.to_string(),
            is_outdated: false,
            comments: vec![],
        })
    }
    async fn resolve_thread(&self, thread_id: &str) -> AgentResult<()> {
        self.resolved.lock().unwrap().push(thread_id.to_string());
        Ok(())
    }
    async fn reply_to_comment(&self, _comment_id: &str, _body: &str) -> AgentResult<()> {
        Ok(())
    }
    async fn request_reviewers(&self, _pr: u64, _reviewers: &[String]) -> AgentResult<()> {
        Ok(())
    }
    async fn open_or_update_pr(&self, _spec: &PrSpec) -> AgentResult<PrHandle> {
        Ok(PrHandle {
            number: 42,
            url: "https://example.test/pr/42".to_string(),
        })
    }
}

struct MemoryHistory {
    seed: Vec<HistoricalOutcome>,
    recorded: Mutex<Vec<HistoricalOutcome>>,
}

impl LearningHistory for MemoryHistory {
    fn outcomes(&self, _topic: &str) -> AgentResult<Vec<HistoricalOutcome>> {
        Ok(self.seed.clone())
    }
    fn record(&self, _topic: &str, outcome: HistoricalOutcome) -> AgentResult<()> {
        self.recorded.lock().unwrap().push(outcome);
        Ok(())
    }
}

fn base_responses() -> Vec<(&'static str, serde_json::Value)> {
    vec![
        (
            "generate_plan",
            serde_json::json!({ "summary": "add retry logic to the fetcher" }),
        ),
        (
            "implementation_plan",
            serde_json::json!({
                "summary": "add retry logic",
                "steps": ["wrap fetch in retry"],
            }),
        ),
        ("learning_note", serde_json::json!({ "note": null })),
    ]
}

fn no_cancel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

fn fast_review(mut config: RunConfig) -> RunConfig {
    config.review.ci_wait.poll_interval = Duration::from_millis(1);
    config.review.ci_wait.timeout = Duration::from_secs(5);
    config
}

#[tokio::test]
async fn full_run_resolves_review_feedback_and_converges() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RunStateStore::new(dir.path()).unwrap());

    let mut responses = base_responses();
    responses.push((
        "classify_review_threads",
        serde_json::json!([
            { "thread_id": "t1", "severity": "blocking" }
        ]),
    ));
    responses.push((
        "review_fix_plan",
        serde_json::json!({
            "summary": "address the null check",
            "steps": ["add guard"],
            "resolved_thread_ids": ["t1"],
        }),
    ));
    let cognition = Arc::new(ScriptedCognition::new(responses));

    let provider = Arc::new(ScriptedProvider::new(vec![
        vec![ReviewThread {
            id: "t1".to_string(),
            is_outdated: false,
            comments: vec![ThreadComment {
                id: Some("c1".to_string()),
                path: Some("src/fetch.rs".to_string()),
                line: Some(14),
                body: "missing null check".to_string(),
            }],
        }],
        // Second iteration: everything resolved.
        vec![],
    ]));
    let implementer = Arc::new(CountingImplementer {
        applied: Mutex::new(0),
    });

    let config = fast_review(RunConfig::new(dir.path().join("wt"), dir.path()));
    let controller = RunController::new(
        Arc::clone(&store),
        config,
        Collaborators {
            cognition: cognition.clone(),
            implementer: implementer.clone(),
            vcs: Arc::new(FakeVcs::new()),
            runner: Arc::new(PassingRunner),
            provider: Some(provider.clone()),
            tracker: Arc::new(NoopTracker),
            history: Arc::new(MemoryHistory {
                seed: vec![],
                recorded: Mutex::new(vec![]),
            }),
        },
    );

    let outcome = controller
        .start("r1", "add retry logic", no_cancel())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.phase, Phase::Complete);

    let doc = store.load("r1").unwrap();
    let review = doc.review.as_ref().unwrap();
    assert!(review.converged);
    assert_eq!(review.iterations, 2);
    assert_eq!(review.pr_number, Some(42));

    // Implementation once, review fix once.
    assert_eq!(*implementer.applied.lock().unwrap(), 2);
    assert!(provider
        .resolved
        .lock()
        .unwrap()
        .contains(&"t1".to_string()));

    for step in [
        "plan.generate",
        "implement.apply",
        "verify.run",
        "github.pr.open",
        "review.iteration.1",
        "review.iteration.2",
        "learning.gate",
    ] {
        assert_eq!(
            doc.step(step).map(|s| s.status),
            Some(StepStatus::Done),
            "step {step}"
        );
    }
}

#[tokio::test]
async fn resume_reclaims_stale_lease_and_skips_done_steps() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RunStateStore::new(dir.path()).unwrap());
    store.create_run("r1").unwrap();

    // A prior process finished planning, then died mid-implementation:
    // plan.generate is done, implement.apply is running with a dead lease.
    let engine = StepEngine::new(Arc::clone(&store), "r1");
    let plan: PlanSummary = engine
        .run_step(
            "plan.generate",
            "Generate plan",
            StepOptions::default(),
            |_h| async {
                Ok(PlanSummary {
                    task_ref: "TASK-7".to_string(),
                    summary: "add retry logic".to_string(),
                    created_at: Utc::now(),
                })
            },
        )
        .await
        .unwrap();
    store
        .update("r1", |doc| {
            doc.plan = Some(plan.clone());
            let mut lease = Lease::new();
            lease.heartbeat_at = Utc::now() - chrono::Duration::seconds(600);
            let rec = doc.step_mut("implement.apply");
            rec.status = StepStatus::Running;
            rec.lease = Some(lease);
            doc.current_step = Some("implement.apply".to_string());
        })
        .unwrap();

    // No generate_plan response: re-invoking the plan step would panic.
    let responses = base_responses()
        .into_iter()
        .filter(|(intent, _)| *intent != "generate_plan")
        .collect();
    let cognition = Arc::new(ScriptedCognition::new(responses));
    let implementer = Arc::new(CountingImplementer {
        applied: Mutex::new(0),
    });

    let config = RunConfig::new(dir.path().join("wt"), dir.path());
    let controller = RunController::new(
        Arc::clone(&store),
        config,
        Collaborators {
            cognition: cognition.clone(),
            implementer: implementer.clone(),
            vcs: Arc::new(FakeVcs::new()),
            runner: Arc::new(PassingRunner),
            provider: None,
            tracker: Arc::new(NoopTracker),
            history: Arc::new(MemoryHistory {
                seed: vec![],
                recorded: Mutex::new(vec![]),
            }),
        },
    );

    let outcome = controller.resume("r1", no_cancel()).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.phase, Phase::Complete);

    // The crashed step re-ran; the finished one did not.
    assert_eq!(*implementer.applied.lock().unwrap(), 1);
    assert_eq!(cognition.calls_for("generate_plan"), 0);
    assert_eq!(cognition.calls_for("implementation_plan"), 1);

    let doc = store.load("r1").unwrap();
    assert_eq!(
        doc.step("implement.apply").map(|s| s.status),
        Some(StepStatus::Done)
    );
    assert_eq!(doc.run.attempt, 2);

    let events = store.read_events("r1").unwrap();
    // The stale lease shows up as a failed finish before the re-run.
    assert!(events.iter().any(|e| matches!(
        &e.event,
        RunEvent::StepFinished { step_id, status: StepStatus::Failed, .. }
            if step_id == "implement.apply"
    )));
    let skipped = events
        .iter()
        .filter(|e| {
            matches!(&e.event, RunEvent::StepSkipped { step_id } if step_id == "plan.generate")
        })
        .count();
    assert!(skipped >= 1);
}

#[tokio::test]
async fn thin_history_parks_the_learning_note() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RunStateStore::new(dir.path()).unwrap());

    let mut responses = base_responses();
    // This run produces a real note.
    responses.retain(|(intent, _)| *intent != "learning_note");
    responses.push((
        "learning_note",
        serde_json::json!({
            "note": {
                "topic": "retry-conventions",
                "summary": "retries use exponential backoff",
                "target_files": ["docs/conventions.md"],
            }
        }),
    ));
    let cognition = Arc::new(ScriptedCognition::new(responses));
    let history = Arc::new(MemoryHistory {
        // Two applied successes against a minimum of five samples: 0.4.
        seed: vec![
            HistoricalOutcome {
                applied: true,
                succeeded: true,
            },
            HistoricalOutcome {
                applied: true,
                succeeded: true,
            },
        ],
        recorded: Mutex::new(vec![]),
    });
    let vcs = Arc::new(FakeVcs::new());

    let config = RunConfig::new(dir.path().join("wt"), dir.path());
    let controller = RunController::new(
        Arc::clone(&store),
        config,
        Collaborators {
            cognition,
            implementer: Arc::new(CountingImplementer {
                applied: Mutex::new(0),
            }),
            vcs: vcs.clone(),
            runner: Arc::new(PassingRunner),
            provider: None,
            tracker: Arc::new(NoopTracker),
            history: history.clone(),
        },
    );

    let outcome = controller
        .start("r1", "add retry logic", no_cancel())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Success);

    let doc = store.load("r1").unwrap();
    let learning = doc.learning.as_ref().unwrap();
    assert_eq!(learning.status, "pending");
    assert_eq!(learning.reason.as_deref(), Some("below_threshold"));
    assert!((learning.confidence - 0.4).abs() < 1e-9);
    assert!(!learning.committed);

    // Only the implementation checkpoint committed; the note never did.
    assert_eq!(*vcs.commits.lock().unwrap(), 1);
    // The parked outcome still feeds future confidence.
    assert_eq!(history.recorded.lock().unwrap().len(), 1);
    assert!(!history.recorded.lock().unwrap()[0].applied);
}
