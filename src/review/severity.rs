//! Review thread severity and the configurable severity policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::review::fingerprint::ThreadFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Question,
    Suggestion,
    Nitpick,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Blocking => "blocking",
            Severity::Question => "question",
            Severity::Suggestion => "suggestion",
            Severity::Nitpick => "nitpick",
        }
    }

    /// Fallback inference when no AI classifier assigned a severity, from the
    /// coarser actionable/ignored/needs-context buckets.
    pub fn from_coarse_bucket(bucket: CoarseBucket) -> Self {
        match bucket {
            CoarseBucket::Actionable => Severity::Blocking,
            CoarseBucket::NeedsContext => Severity::Question,
            CoarseBucket::Ignored => Severity::Nitpick,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseBucket {
    Actionable,
    Ignored,
    NeedsContext,
}

/// What the loop does with a thread of a given severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAction {
    Actionable,
    Ignore,
    AutoResolve,
}

/// Total mapping from severity to action. Every severity has an action, so
/// classified threads partition into exactly one of the three sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityPolicy {
    map: BTreeMap<Severity, ThreadAction>,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert(Severity::Blocking, ThreadAction::Actionable);
        map.insert(Severity::Question, ThreadAction::Actionable);
        map.insert(Severity::Suggestion, ThreadAction::Ignore);
        map.insert(Severity::Nitpick, ThreadAction::AutoResolve);
        Self { map }
    }
}

impl SeverityPolicy {
    pub fn with_action(mut self, severity: Severity, action: ThreadAction) -> Self {
        self.map.insert(severity, action);
        self
    }

    pub fn action_for(&self, severity: Severity) -> ThreadAction {
        // The default map is total; an override can only replace entries.
        *self.map.get(&severity).unwrap_or(&ThreadAction::Actionable)
    }

    /// Split classified threads into disjoint actionable/ignored/auto-resolve
    /// sets covering every input thread.
    pub fn partition(&self, threads: Vec<ClassifiedThread>) -> Partition {
        let mut partition = Partition::default();
        for thread in threads {
            match self.action_for(thread.severity) {
                ThreadAction::Actionable => partition.actionable.push(thread),
                ThreadAction::Ignore => partition.ignored.push(thread),
                ThreadAction::AutoResolve => partition.auto_resolve.push(thread),
            }
        }
        partition
    }
}

/// A fingerprinted thread with its assigned severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedThread {
    pub fingerprint: ThreadFingerprint,
    pub severity: Severity,
    /// Classifier flag: the fix plan needs this thread's full comment bodies.
    #[serde(default)]
    pub needs_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Partition {
    pub actionable: Vec<ClassifiedThread>,
    pub ignored: Vec<ClassifiedThread>,
    pub auto_resolve: Vec<ClassifiedThread>,
}

impl Partition {
    pub fn total(&self) -> usize {
        self.actionable.len() + self.ignored.len() + self.auto_resolve.len()
    }
}
