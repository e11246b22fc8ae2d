//! Run configuration.
//!
//! One aggregate handed to the controller at construction. Nothing here reads
//! the environment; the embedding binary decides where values come from.

use std::path::PathBuf;

use crate::collab::VerifyCommand;
use crate::learning::LearningConfig;
use crate::review::ReviewLoopConfig;
use crate::verify::AutoFixSettings;

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Repository the run operates on.
    pub worktree: PathBuf,
    /// Root for run documents, events and artifacts.
    pub state_dir: PathBuf,
    /// Plan and verify, but never mutate the repo or remote state.
    pub dry_run: bool,
    pub allow_mutation: bool,
    /// Task tracker reference, when one exists.
    pub task_ref: Option<String>,
    /// Branch the run commits to and opens the PR from.
    pub branch: String,
    pub base_branch: String,
    pub verify_commands: Vec<VerifyCommand>,
    pub verify_fail_fast: bool,
    pub auto_fix: AutoFixSettings,
    pub review: ReviewLoopConfig,
    pub learning: LearningConfig,
}

impl RunConfig {
    pub fn new(worktree: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            worktree: worktree.into(),
            state_dir: state_dir.into(),
            dry_run: false,
            allow_mutation: true,
            task_ref: None,
            branch: "agent/run".to_string(),
            base_branch: "main".to_string(),
            verify_commands: Vec::new(),
            verify_fail_fast: false,
            auto_fix: AutoFixSettings::default(),
            review: ReviewLoopConfig::default(),
            learning: LearningConfig::default(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        if dry_run {
            self.allow_mutation = false;
            self.auto_fix.dry_run = true;
            self.auto_fix.allow_mutation = false;
            self.review.allow_mutation = false;
            self.learning.allow_apply = false;
        }
        self
    }

    pub fn with_task_ref(mut self, task_ref: impl Into<String>) -> Self {
        self.task_ref = Some(task_ref.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>, base: impl Into<String>) -> Self {
        self.branch = branch.into();
        self.base_branch = base.into();
        self
    }

    pub fn with_verify_commands(mut self, commands: Vec<VerifyCommand>) -> Self {
        self.verify_commands = commands;
        self
    }

    pub fn with_reviewers(mut self, reviewers: Vec<String>) -> Self {
        self.review.reviewers = reviewers;
        self
    }
}
