//! Durable per-run state store.
//!
//! Layout under the state directory:
//!
//! ```text
//! runs/<run_id>.json           the run document
//! runs/<run_id>.events.jsonl   append-only event log
//! runs/<run_id>.lock           advisory run lock (held by the controller)
//! artifacts/<run_id>/<step_id>/<name>.json
//! ```
//!
//! The document is the only shared mutable resource: all mutation goes through
//! [`RunStateStore::update`], which performs an atomic read-modify-write
//! (write to a temp file, then rename) and emits a persistence event.
//! Artifacts are write-once per (step, name) and never mutated in place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{AgentError, AgentResult};
use crate::state::events::{EventEnvelope, EventSink, RunEvent};
use crate::state::model::{ArtifactRef, RunDocument, SCHEMA_VERSION};

pub struct RunStateStore {
    runs_dir: PathBuf,
    artifacts_dir: PathBuf,
    sink: Option<Arc<dyn EventSink>>,
}

impl RunStateStore {
    pub fn new(state_dir: &Path) -> AgentResult<Self> {
        let runs_dir = state_dir.join("runs");
        let artifacts_dir = state_dir.join("artifacts");
        fs::create_dir_all(&runs_dir).context("Failed to create runs directory")?;
        fs::create_dir_all(&artifacts_dir).context("Failed to create artifacts directory")?;
        Ok(Self {
            runs_dir,
            artifacts_dir,
            sink: None,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn document_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    pub fn events_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.events.jsonl"))
    }

    pub fn lock_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.lock"))
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.document_path(run_id).exists()
    }

    /// Create a fresh run document. Fails with a conflict if one exists.
    pub fn create_run(&self, run_id: &str) -> AgentResult<RunDocument> {
        if self.exists(run_id) {
            return Err(AgentError::conflict(format!(
                "run {run_id} already exists"
            )));
        }
        let doc = RunDocument::new(run_id);
        self.persist(&doc)?;
        self.append_event(
            run_id,
            RunEvent::RunStarted {
                attempt: doc.run.attempt,
            },
        )?;
        Ok(doc)
    }

    /// Load and validate a run document.
    ///
    /// Rejects unknown schema versions with a validation error rather than
    /// letting callers branch on document shape.
    pub fn load(&self, run_id: &str) -> AgentResult<RunDocument> {
        let path = self.document_path(run_id);
        if !path.exists() {
            return Err(AgentError::not_found(format!("run {run_id}")));
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run document at {}", path.display()))?;
        let doc: RunDocument = serde_json::from_str(&raw).map_err(|e| {
            AgentError::validation("run_document_shape", format!("run {run_id}: {e}"))
        })?;
        if doc.schema_version != SCHEMA_VERSION {
            return Err(AgentError::validation(
                "run_document_version",
                format!(
                    "run {run_id} has schema version {} but this build expects {}",
                    doc.schema_version, SCHEMA_VERSION
                ),
            ));
        }
        Ok(doc)
    }

    /// The single read-modify-write entry point for the run document.
    ///
    /// Loads, applies `mutate`, bumps `updated_at`, writes atomically and
    /// emits a persistence event. Returns whatever `mutate` returns.
    pub fn update<T>(
        &self,
        run_id: &str,
        mutate: impl FnOnce(&mut RunDocument) -> T,
    ) -> AgentResult<T> {
        let mut doc = self.load(run_id)?;
        let out = mutate(&mut doc);
        doc.run.updated_at = Utc::now();
        self.persist(&doc)?;
        self.append_event(run_id, RunEvent::DocumentPersisted)?;
        Ok(out)
    }

    fn persist(&self, doc: &RunDocument) -> AgentResult<()> {
        let path = self.document_path(&doc.run.id);
        let tmp = path.with_extension("json.tmp");
        let json =
            serde_json::to_string_pretty(doc).context("Failed to serialize run document")?;
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Append one event to the run's log and forward it to the sink.
    pub fn append_event(&self, run_id: &str, event: RunEvent) -> AgentResult<()> {
        let envelope = EventEnvelope::new(run_id, event);
        let line = serde_json::to_string(&envelope).context("Failed to serialize event")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(run_id))
            .context("Failed to open event log")?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .context("Failed to append event")?;
        if let Some(ref sink) = self.sink {
            sink.emit(&envelope);
        }
        Ok(())
    }

    pub fn read_events(&self, run_id: &str) -> AgentResult<Vec<EventEnvelope>> {
        let path = self.events_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).context("Failed to read event log")?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let envelope: EventEnvelope = serde_json::from_str(line)
                .map_err(|e| AgentError::validation("event_shape", e.to_string()))?;
            events.push(envelope);
        }
        Ok(events)
    }

    fn artifact_path(&self, locator: &str) -> PathBuf {
        self.artifacts_dir.join(locator)
    }

    /// Persist a named artifact for a step. Write-once: re-writing an existing
    /// (step, name) pair returns the existing reference untouched, so step
    /// re-entry stays idempotent.
    pub fn write_artifact<T: Serialize>(
        &self,
        run_id: &str,
        step_id: &str,
        name: &str,
        value: &T,
    ) -> AgentResult<ArtifactRef> {
        let locator = format!("{run_id}/{step_id}/{name}.json");
        let path = self.artifact_path(&locator);
        if path.exists() {
            return Ok(ArtifactRef { locator });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create artifact directory")?;
        }
        let json = serde_json::to_string_pretty(value).context("Failed to serialize artifact")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("Failed to write artifact")?;
        fs::rename(&tmp, &path).context("Failed to finalize artifact")?;
        Ok(ArtifactRef { locator })
    }

    /// Read back an artifact by step id and name, resolving through the
    /// document's artifacts index.
    pub fn read_artifact<T: DeserializeOwned>(
        &self,
        run_id: &str,
        step_id: &str,
        name: &str,
    ) -> AgentResult<T> {
        let doc = self.load(run_id)?;
        let step = doc
            .step(step_id)
            .ok_or_else(|| AgentError::not_found(format!("step {step_id}")))?;
        let artifact = step
            .artifacts
            .get(name)
            .ok_or_else(|| AgentError::not_found(format!("artifact {step_id}/{name}")))?;
        let path = self.artifact_path(&artifact.locator);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact at {}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| AgentError::validation("artifact_shape", e.to_string()))
    }
}
