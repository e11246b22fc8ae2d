//! Run state: durable document model, store and event stream.

pub mod events;
pub mod model;
pub mod store;

pub use events::{EventEnvelope, EventSink, RunEvent};
pub use model::{
    ArtifactRef, AutoFixOutcome, AutoFixRecord, Checkpoint, ErrorRecord, Lease, LearningSummary,
    PlanSummary, ReviewSummary, RunDocument, RunRecord, RunStatus, StepRecord, StepStatus,
    VerificationSummary, LEASE_STALENESS, SCHEMA_VERSION,
};
pub use store::RunStateStore;
