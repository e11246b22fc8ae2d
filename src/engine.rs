//! Step execution engine.
//!
//! Wraps an arbitrary asynchronous operation with idempotency bookkeeping,
//! lease-based crash detection, input/output digesting and artifact capture.
//! A step already recorded `done` is skipped and its persisted output is
//! returned instead of re-invoking the closure; callers that genuinely need
//! re-execution opt out with [`StepOptions::force`].

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::state::events::RunEvent;
use crate::state::model::{ArtifactRef, ErrorRecord, Lease, StepStatus};
use crate::state::store::RunStateStore;
use crate::util::digest_json;

/// Artifact name under which a step's return value is persisted.
pub const OUTPUT_ARTIFACT: &str = "output";

#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Semantic inputs of the step, digested for idempotency/observability.
    pub inputs: Option<serde_json::Value>,
    /// Re-execute even if the step is already `done`.
    pub force: bool,
}

impl StepOptions {
    pub fn with_inputs(inputs: serde_json::Value) -> Self {
        Self {
            inputs: Some(inputs),
            force: false,
        }
    }
}

/// Live handle given to a step body: lease refresh and artifact capture.
#[derive(Clone)]
pub struct StepHandle {
    store: Arc<RunStateStore>,
    run_id: String,
    step_id: String,
    lease_id: Uuid,
}

impl StepHandle {
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Refresh the step's lease so a long poll stays distinguishable from a
    /// crash. Fails if the lease was reclaimed by another process.
    pub fn heartbeat(&self) -> AgentResult<()> {
        let lease_id = self.lease_id;
        let step_id = self.step_id.clone();
        let beaten = self.store.update(&self.run_id, |doc| {
            let rec = doc.step_mut(&step_id);
            match rec.lease.as_mut() {
                Some(lease) if lease.lease_id == lease_id => {
                    lease.beat();
                    true
                }
                _ => false,
            }
        })?;
        if !beaten {
            return Err(AgentError::conflict(format!(
                "lease {lease_id} on step {step_id} is no longer held"
            )));
        }
        self.store.append_event(
            &self.run_id,
            RunEvent::StepHeartbeat {
                step_id: self.step_id.clone(),
                lease_id,
            },
        )
    }

    /// Persist a named artifact and index it on the step record.
    pub fn put_artifact<T: Serialize>(&self, name: &str, value: &T) -> AgentResult<ArtifactRef> {
        let artifact = self
            .store
            .write_artifact(&self.run_id, &self.step_id, name, value)?;
        let step_id = self.step_id.clone();
        let reference = artifact.clone();
        let name = name.to_string();
        self.store.update(&self.run_id, move |doc| {
            doc.step_mut(&step_id).artifacts.insert(name, reference);
        })?;
        Ok(artifact)
    }
}

pub struct StepEngine {
    store: Arc<RunStateStore>,
    run_id: String,
}

impl StepEngine {
    pub fn new(store: Arc<RunStateStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute `body` as the named step.
    ///
    /// Records `running` with a fresh lease and inputs digest before
    /// invoking; on success digests and persists the output, marks `done`;
    /// on failure records a structured error, marks `failed` and re-throws.
    /// Every transition emits a run-step event.
    pub async fn run_step<T, F, Fut>(
        &self,
        step_id: &str,
        title: &str,
        opts: StepOptions,
        body: F,
    ) -> AgentResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(StepHandle) -> Fut,
        Fut: Future<Output = AgentResult<T>>,
    {
        let doc = self.store.load(&self.run_id)?;
        if let Some(existing) = doc.step(step_id)
            && existing.status == StepStatus::Done
            && !opts.force
        {
            tracing::debug!(run_id = %self.run_id, step_id, "step already done, reusing output");
            self.store.append_event(
                &self.run_id,
                RunEvent::StepSkipped {
                    step_id: step_id.to_string(),
                },
            )?;
            return self
                .store
                .read_artifact(&self.run_id, step_id, OUTPUT_ARTIFACT);
        }

        let inputs_digest = opts.inputs.as_ref().map(digest_json);
        let lease = Lease::new();
        let lease_id = lease.lease_id;

        {
            let step_id = step_id.to_string();
            let title = title.to_string();
            let inputs_digest = inputs_digest.clone();
            self.store.update(&self.run_id, move |doc| {
                doc.current_step = Some(step_id.clone());
                let rec = doc.step_mut(&step_id);
                rec.status = StepStatus::Running;
                rec.title = title;
                rec.started_at = Some(Utc::now());
                rec.ended_at = None;
                rec.inputs_digest = inputs_digest;
                rec.outputs_digest = None;
                rec.error = None;
                rec.lease = Some(lease);
            })?;
        }
        self.store.append_event(
            &self.run_id,
            RunEvent::StepStarted {
                step_id: step_id.to_string(),
                title: title.to_string(),
                lease_id,
                inputs_digest,
            },
        )?;
        tracing::info!(run_id = %self.run_id, step_id, title, "step started");

        let handle = StepHandle {
            store: Arc::clone(&self.store),
            run_id: self.run_id.clone(),
            step_id: step_id.to_string(),
            lease_id,
        };

        match body(handle.clone()).await {
            Ok(value) => {
                let serialized = serde_json::to_value(&value)
                    .map_err(|e| AgentError::internal(format!("unserializable step output: {e}")))?;
                let outputs_digest = digest_json(&serialized);
                handle.put_artifact(OUTPUT_ARTIFACT, &serialized)?;
                {
                    let step_id = step_id.to_string();
                    let outputs_digest = outputs_digest.clone();
                    self.store.update(&self.run_id, move |doc| {
                        doc.current_step = None;
                        let rec = doc.step_mut(&step_id);
                        rec.status = StepStatus::Done;
                        rec.ended_at = Some(Utc::now());
                        rec.outputs_digest = Some(outputs_digest);
                        rec.lease = None;
                    })?;
                }
                self.store.append_event(
                    &self.run_id,
                    RunEvent::StepFinished {
                        step_id: step_id.to_string(),
                        status: StepStatus::Done,
                        outputs_digest: Some(outputs_digest),
                        error: None,
                    },
                )?;
                tracing::info!(run_id = %self.run_id, step_id, "step done");
                Ok(value)
            }
            Err(err) => {
                let record = ErrorRecord::from(&err);
                {
                    let step_id = step_id.to_string();
                    let record = record.clone();
                    self.store.update(&self.run_id, move |doc| {
                        doc.current_step = None;
                        let rec = doc.step_mut(&step_id);
                        rec.status = StepStatus::Failed;
                        rec.ended_at = Some(Utc::now());
                        rec.error = Some(record);
                        rec.lease = None;
                    })?;
                }
                self.store.append_event(
                    &self.run_id,
                    RunEvent::StepFinished {
                        step_id: step_id.to_string(),
                        status: StepStatus::Failed,
                        outputs_digest: None,
                        error: Some(record.message.clone()),
                    },
                )?;
                tracing::warn!(run_id = %self.run_id, step_id, error = %record.message, "step failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::StepStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn make_engine() -> (StepEngine, Arc<RunStateStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RunStateStore::new(dir.path()).unwrap());
        store.create_run("r1").unwrap();
        (StepEngine::new(Arc::clone(&store), "r1"), store, dir)
    }

    #[tokio::test]
    async fn successful_step_records_done_with_digests() {
        let (engine, store, _dir) = make_engine();
        let out: String = engine
            .run_step(
                "plan.generate",
                "Generate plan",
                StepOptions::with_inputs(serde_json::json!({"task": "TASK-1"})),
                |_h| async { Ok("the plan".to_string()) },
            )
            .await
            .unwrap();
        assert_eq!(out, "the plan");

        let doc = store.load("r1").unwrap();
        let rec = doc.step("plan.generate").unwrap();
        assert_eq!(rec.status, StepStatus::Done);
        assert!(rec.inputs_digest.is_some());
        assert!(rec.outputs_digest.is_some());
        assert!(rec.lease.is_none());
        assert!(rec.artifacts.contains_key(OUTPUT_ARTIFACT));
        assert!(doc.current_step.is_none());
    }

    #[tokio::test]
    async fn done_step_is_not_reinvoked() {
        let (engine, _store, _dir) = make_engine();
        let invocations = AtomicU32::new(0);

        for _ in 0..2 {
            let out: u32 = engine
                .run_step("github.pr.open", "Open PR", StepOptions::default(), |_h| {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    async { Ok(42u32) }
                })
                .await
                .unwrap();
            assert_eq!(out, 42);
        }
        // The side-effecting body ran exactly once.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_reexecutes_a_done_step() {
        let (engine, _store, _dir) = make_engine();
        let invocations = AtomicU32::new(0);

        for _ in 0..2 {
            let _: u32 = engine
                .run_step(
                    "verify.run",
                    "Run verification",
                    StepOptions {
                        inputs: None,
                        force: true,
                    },
                    |_h| {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        async { Ok(0u32) }
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_step_records_error_and_rethrows() {
        let (engine, store, _dir) = make_engine();
        let err = engine
            .run_step::<u32, _, _>("verify.run", "Run verification", StepOptions::default(), |_h| async {
                Err(AgentError::expected("verification_failed", "lint failed"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "verification_failed");

        let doc = store.load("r1").unwrap();
        let rec = doc.step("verify.run").unwrap();
        assert_eq!(rec.status, StepStatus::Failed);
        let error = rec.error.as_ref().unwrap();
        assert_eq!(error.code, "verification_failed");
        assert!(rec.lease.is_none());
        assert!(doc.current_step.is_none());
    }

    #[tokio::test]
    async fn failed_step_reruns_on_next_entry() {
        let (engine, _store, _dir) = make_engine();
        let _ = engine
            .run_step::<u32, _, _>("flaky", "Flaky step", StepOptions::default(), |_h| async {
                Err(AgentError::internal("first attempt"))
            })
            .await;
        let out: u32 = engine
            .run_step("flaky", "Flaky step", StepOptions::default(), |_h| async {
                Ok(7u32)
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn running_step_holds_a_lease_and_current_pointer() {
        let (engine, store, _dir) = make_engine();
        let store_probe = Arc::clone(&store);
        let _: u32 = engine
            .run_step("ci.wait", "Wait for CI", StepOptions::default(), |_h| {
                let store = store_probe;
                async move {
                    let doc = store.load("r1").unwrap();
                    let rec = doc.step("ci.wait").unwrap();
                    assert_eq!(rec.status, StepStatus::Running);
                    assert!(rec.lease.is_some());
                    assert_eq!(doc.current_step.as_deref(), Some("ci.wait"));
                    Ok(1u32)
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn heartbeat_refreshes_the_lease() {
        let (engine, store, _dir) = make_engine();
        let store_probe = Arc::clone(&store);
        let _: u32 = engine
            .run_step("ci.wait", "Wait for CI", StepOptions::default(), |h| {
                let store = store_probe;
                async move {
                    let before = store
                        .load("r1")
                        .unwrap()
                        .step("ci.wait")
                        .unwrap()
                        .lease
                        .as_ref()
                        .unwrap()
                        .heartbeat_at;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    h.heartbeat().unwrap();
                    let after = store
                        .load("r1")
                        .unwrap()
                        .step("ci.wait")
                        .unwrap()
                        .lease
                        .as_ref()
                        .unwrap()
                        .heartbeat_at;
                    assert!(after > before);
                    Ok(0u32)
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn step_artifacts_are_retrievable_by_name() {
        let (engine, store, _dir) = make_engine();
        let _: u32 = engine
            .run_step("review.iteration.1", "Review iteration", StepOptions::default(), |h| async move {
                h.put_artifact("report", &serde_json::json!({"status": "converged"}))?;
                Ok(0u32)
            })
            .await
            .unwrap();
        let report: serde_json::Value = store
            .read_artifact("r1", "review.iteration.1", "report")
            .unwrap();
        assert_eq!(report["status"], "converged");
    }

    #[tokio::test]
    async fn events_trace_the_step_lifecycle() {
        let (engine, store, _dir) = make_engine();
        let _: u32 = engine
            .run_step("plan.generate", "Generate plan", StepOptions::default(), |_h| async {
                Ok(0u32)
            })
            .await
            .unwrap();
        let events = store.read_events("r1").unwrap();
        let started = events
            .iter()
            .any(|e| matches!(&e.event, RunEvent::StepStarted { step_id, .. } if step_id == "plan.generate"));
        let finished = events.iter().any(|e| {
            matches!(&e.event, RunEvent::StepFinished { step_id, status: StepStatus::Done, .. } if step_id == "plan.generate")
        });
        assert!(started && finished);
    }
}
