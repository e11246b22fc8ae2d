//! Collaborator contracts the run controller drives.
//!
//! Everything long-running, expensive or remote sits behind one of these
//! traits: cognition (the LLM), version control, the verification runner, the
//! code-review/CI provider and the task tracker. The controller only ever
//! sees typed results, never raw wire payloads.
//!
//! Subprocess-backed implementations for git, shell verification commands and
//! an agent CLI live here too; the review/CI provider and tracker have no
//! default implementation and are supplied by the embedding application.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{AgentError, AgentResult};

// ---------------------------------------------------------------------------
// Cognition
// ---------------------------------------------------------------------------

/// One request to the cognition layer: a named intent plus JSON context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitionRequest {
    pub intent: String,
    pub context: serde_json::Value,
}

impl CognitionRequest {
    pub fn new(intent: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            intent: intent.into(),
            context,
        }
    }
}

/// Opaque structured-output AI invocation.
#[async_trait]
pub trait Cognition: Send + Sync {
    async fn invoke(&self, request: CognitionRequest) -> AgentResult<serde_json::Value>;
}

/// Invoke cognition and validate the result against the target type.
///
/// Invalid output is a hard failure for the calling step; it is never
/// silently coerced.
pub async fn invoke_typed<T: DeserializeOwned>(
    cognition: &dyn Cognition,
    request: CognitionRequest,
) -> AgentResult<T> {
    let intent = request.intent.clone();
    let value = cognition.invoke(request).await?;
    serde_json::from_value(value).map_err(|e| {
        AgentError::validation(
            "cognition_schema",
            format!("cognition output for `{intent}` did not match the expected schema: {e}"),
        )
    })
}

/// A concrete change plan produced by cognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixPlan {
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Review threads this plan claims to fully address.
    #[serde(default)]
    pub resolved_thread_ids: Vec<String>,
}

/// Outcome of applying a [`FixPlan`] to the worktree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApplyReport {
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Executes a change plan against the worktree.
#[async_trait]
pub trait Implementer: Send + Sync {
    async fn apply_plan(&self, plan: &FixPlan, cwd: &Path) -> AgentResult<ApplyReport>;
}

// ---------------------------------------------------------------------------
// Version control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Version-control subprocess contract. Non-zero exits are data, not errors:
/// callers probe exit codes (`diff --cached --quiet` is an emptiness check).
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn run(&self, args: &[&str], cwd: &Path) -> AgentResult<ExecOutput>;
}

/// `git` on the PATH.
pub struct GitCli;

#[async_trait]
impl VersionControl for GitCli {
    async fn run(&self, args: &[&str], cwd: &Path) -> AgentResult<ExecOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .context("Failed to spawn git")?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub ok: bool,
    pub results: Vec<CommandResult>,
}

impl VerificationOutcome {
    pub fn failing_names(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.name.clone())
            .collect()
    }
}

/// Runs the project's named verification commands.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    /// Run all commands, or only those named in `selected`.
    async fn run(
        &self,
        selected: Option<&[String]>,
        cwd: &Path,
    ) -> AgentResult<VerificationOutcome>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCommand {
    pub name: String,
    pub shell: String,
}

/// Shell-backed verification runner.
pub struct CommandVerifier {
    commands: Vec<VerifyCommand>,
    fail_fast: bool,
}

impl CommandVerifier {
    pub fn new(commands: Vec<VerifyCommand>, fail_fast: bool) -> Self {
        Self {
            commands,
            fail_fast,
        }
    }
}

#[async_trait]
impl VerificationRunner for CommandVerifier {
    async fn run(
        &self,
        selected: Option<&[String]>,
        cwd: &Path,
    ) -> AgentResult<VerificationOutcome> {
        let mut results = Vec::new();
        let mut ok = true;
        for command in &self.commands {
            if let Some(names) = selected
                && !names.contains(&command.name)
            {
                continue;
            }
            let output = Command::new("sh")
                .arg("-c")
                .arg(&command.shell)
                .current_dir(cwd)
                .output()
                .await
                .with_context(|| format!("Failed to spawn verification command {}", command.name))?;
            let result = CommandResult {
                name: command.name.clone(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            let passed = result.passed();
            tracing::debug!(name = %result.name, exit_code = result.exit_code, "verification command finished");
            results.push(result);
            if !passed {
                ok = false;
                if self.fail_fast {
                    break;
                }
            }
        }
        Ok(VerificationOutcome { ok, results })
    }
}

// ---------------------------------------------------------------------------
// Code review / CI provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    Pending,
    Passing,
    Failing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiResult {
    pub state: CiState,
    #[serde(default)]
    pub failing_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadComment {
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewThread {
    pub id: String,
    pub is_outdated: bool,
    pub comments: Vec<ThreadComment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSpec {
    pub title: String,
    pub body: String,
    pub branch: String,
    pub base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrHandle {
    pub number: u64,
    pub url: String,
}

/// Code-hosting provider: CI status, review threads, PR management.
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// One CI status probe. The bounded wait loop lives in [`wait_for_ci`].
    async fn check_ci(&self, pr: u64) -> AgentResult<CiResult>;
    async fn fetch_unresolved_threads(&self, pr: u64) -> AgentResult<Vec<ReviewThread>>;
    async fn fetch_thread(&self, thread_id: &str) -> AgentResult<ReviewThread>;
    async fn resolve_thread(&self, thread_id: &str) -> AgentResult<()>;
    async fn reply_to_comment(&self, comment_id: &str, body: &str) -> AgentResult<()>;
    async fn request_reviewers(&self, pr: u64, reviewers: &[String]) -> AgentResult<()>;
    async fn open_or_update_pr(&self, spec: &PrSpec) -> AgentResult<PrHandle>;
}

#[derive(Debug, Clone, Copy)]
pub struct CiWaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for CiWaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(45 * 60),
        }
    }
}

/// Poll CI until it reaches a terminal state or the timeout elapses.
///
/// `on_tick` runs at every poll so the wrapping step can refresh its lease;
/// a legitimately blocked long poll must stay distinguishable from a crash.
pub async fn wait_for_ci(
    provider: &dyn ReviewProvider,
    pr: u64,
    opts: &CiWaitOptions,
    mut on_tick: impl FnMut() -> AgentResult<()>,
) -> AgentResult<CiResult> {
    let deadline = tokio::time::Instant::now() + opts.timeout;
    loop {
        let result = provider.check_ci(pr).await?;
        on_tick()?;
        if result.state != CiState::Pending {
            return Ok(result);
        }
        if tokio::time::Instant::now() + opts.poll_interval > deadline {
            return Err(AgentError::expected(
                "ci_timeout",
                format!("CI did not reach a terminal state within {:?}", opts.timeout),
            ));
        }
        tokio::time::sleep(opts.poll_interval).await;
    }
}

// ---------------------------------------------------------------------------
// Task tracker
// ---------------------------------------------------------------------------

/// Issue-tracker hooks. All operations are best-effort status mirroring.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn move_task_in_progress(&self, task_ref: &str) -> AgentResult<()>;
    async fn move_task_in_review(&self, task_ref: &str) -> AgentResult<()>;
    async fn complete_task(&self, task_ref: &str) -> AgentResult<()>;
    async fn comment_on_pr_open(&self, task_ref: &str, pr: &PrHandle) -> AgentResult<()>;
}

/// Tracker for tasks without a tracking provider: every operation is a no-op.
pub struct NoopTracker;

#[async_trait]
impl TaskTracker for NoopTracker {
    async fn move_task_in_progress(&self, _task_ref: &str) -> AgentResult<()> {
        Ok(())
    }
    async fn move_task_in_review(&self, _task_ref: &str) -> AgentResult<()> {
        Ok(())
    }
    async fn complete_task(&self, _task_ref: &str) -> AgentResult<()> {
        Ok(())
    }
    async fn comment_on_pr_open(&self, _task_ref: &str, _pr: &PrHandle) -> AgentResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subprocess agent (cognition + implementer)
// ---------------------------------------------------------------------------

/// Agent CLI driven over stdin/stdout JSON.
///
/// The request is written to stdin as one JSON object; the last line of
/// stdout must be the structured result.
pub struct SubprocessAgent {
    program: String,
    args: Vec<String>,
}

impl SubprocessAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn exchange(&self, payload: &serde_json::Value) -> AgentResult<serde_json::Value> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn agent process {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .await
                .context("Failed to write agent request")?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for agent process")?;
        if !output.status.success() {
            return Err(AgentError::internal(format!(
                "agent process exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        serde_json::from_str(last).map_err(|e| {
            AgentError::validation(
                "agent_output_shape",
                format!("agent process did not produce JSON output: {e}"),
            )
        })
    }
}

#[async_trait]
impl Cognition for SubprocessAgent {
    async fn invoke(&self, request: CognitionRequest) -> AgentResult<serde_json::Value> {
        let payload = serde_json::json!({
            "intent": request.intent,
            "context": request.context,
        });
        self.exchange(&payload).await
    }
}

#[async_trait]
impl Implementer for SubprocessAgent {
    async fn apply_plan(&self, plan: &FixPlan, cwd: &Path) -> AgentResult<ApplyReport> {
        let payload = serde_json::json!({
            "intent": "apply_plan",
            "context": { "plan": plan, "cwd": cwd },
        });
        let value = self.exchange(&payload).await?;
        serde_json::from_value(value).map_err(|e| {
            AgentError::validation(
                "agent_output_shape",
                format!("apply_plan output did not match ApplyReport: {e}"),
            )
        })
    }
}
