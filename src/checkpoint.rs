//! Content-gated version-control checkpoints.
//!
//! A checkpoint stages the given paths, probes the index for staged content
//! (`diff --cached --quiet`) and only commits when there is something to
//! commit. The resulting HEAD SHA marks a safe resumption point regardless of
//! whether a new commit was produced.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collab::{ExecOutput, VersionControl};
use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    /// False when the index was empty and no commit was made.
    pub committed: bool,
    pub sha: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffStats {
    pub files_changed: usize,
    pub lines_added: u64,
    pub lines_removed: u64,
}

pub struct CheckpointManager<'a> {
    vcs: &'a dyn VersionControl,
    worktree: &'a Path,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(vcs: &'a dyn VersionControl, worktree: &'a Path) -> Self {
        Self { vcs, worktree }
    }

    async fn git(&self, args: &[&str]) -> AgentResult<ExecOutput> {
        self.vcs.run(args, self.worktree).await
    }

    fn require_ok(out: ExecOutput, what: &str) -> AgentResult<ExecOutput> {
        if out.ok() {
            Ok(out)
        } else {
            Err(AgentError::internal(format!(
                "git {what} failed (exit {}): {}",
                out.exit_code,
                out.stderr.trim()
            )))
        }
    }

    pub async fn head_sha(&self) -> AgentResult<String> {
        let out = Self::require_ok(self.git(&["rev-parse", "HEAD"]).await?, "rev-parse")?;
        Ok(out.stdout.trim().to_string())
    }

    /// Stage `paths` (or everything when empty) and commit if anything is
    /// actually staged. Returns the HEAD SHA either way.
    pub async fn checkpoint(
        &self,
        message: &str,
        paths: &[PathBuf],
    ) -> AgentResult<CheckpointOutcome> {
        if paths.is_empty() {
            Self::require_ok(self.git(&["add", "-A"]).await?, "add")?;
        } else {
            let mut args = vec!["add", "--"];
            let rendered: Vec<String> = paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            args.extend(rendered.iter().map(String::as_str));
            Self::require_ok(self.git(&args).await?, "add")?;
        }

        // Emptiness probe: exit 0 means nothing staged.
        let probe = self.git(&["diff", "--cached", "--quiet"]).await?;
        if probe.ok() {
            let sha = self.head_sha().await?;
            tracing::debug!(sha = %sha, "checkpoint skipped, nothing staged");
            return Ok(CheckpointOutcome {
                committed: false,
                sha,
                message: message.to_string(),
            });
        }

        Self::require_ok(self.git(&["commit", "-m", message]).await?, "commit")?;
        let sha = self.head_sha().await?;
        tracing::info!(sha = %sha, message, "checkpoint committed");
        Ok(CheckpointOutcome {
            committed: true,
            sha,
            message: message.to_string(),
        })
    }

    /// Diff stats between `from_sha` and the current worktree, for audit
    /// records around auto-fix attempts.
    pub async fn diff_stats(&self, from_sha: &str) -> AgentResult<DiffStats> {
        let out = Self::require_ok(
            self.git(&["diff", "--numstat", from_sha]).await?,
            "diff --numstat",
        )?;
        let mut stats = DiffStats::default();
        for line in out.stdout.lines() {
            let mut parts = line.split_whitespace();
            let added = parts.next().and_then(|v| v.parse::<u64>().ok());
            let removed = parts.next().and_then(|v| v.parse::<u64>().ok());
            if parts.next().is_none() {
                continue;
            }
            stats.files_changed += 1;
            // Binary files show "-" and parse to None.
            stats.lines_added += added.unwrap_or(0);
            stats.lines_removed += removed.unwrap_or(0);
        }
        Ok(stats)
    }

    pub async fn push(&self) -> AgentResult<()> {
        Self::require_ok(self.git(&["push"]).await?, "push")?;
        Ok(())
    }
}
