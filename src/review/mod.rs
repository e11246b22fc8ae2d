//! Review loop: thread fingerprints, severity policy and the iteration
//! orchestrator.

pub mod fingerprint;
pub mod orchestrator;
pub mod severity;

pub use fingerprint::{fingerprint_thread, CommentFingerprint, ThreadFingerprint};
pub use orchestrator::{
    IterationReport, ReviewIterationContext, ReviewLoop, ReviewLoopConfig, ReviewLoopExit,
};
pub use severity::{
    ClassifiedThread, CoarseBucket, Partition, Severity, SeverityPolicy, ThreadAction,
};
