//! Append-only run event stream.
//!
//! Events decouple observers (rendering, auditing) from control flow: every
//! step transition, phase change and document persistence emits one event,
//! appended to a per-run JSONL log and forwarded to an optional in-process
//! sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::Phase;
use crate::state::model::{RunStatus, StepStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        attempt: u32,
    },
    RunFinished {
        status: RunStatus,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StepStarted {
        step_id: String,
        title: String,
        lease_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inputs_digest: Option<String>,
    },
    StepHeartbeat {
        step_id: String,
        lease_id: Uuid,
    },
    StepFinished {
        step_id: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs_digest: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StepSkipped {
        step_id: String,
    },
    DocumentPersisted,
}

/// An event with its run id and timestamp, as written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub run_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

impl EventEnvelope {
    pub fn new(run_id: impl Into<String>, event: RunEvent) -> Self {
        Self {
            run_id: run_id.into(),
            at: Utc::now(),
            event,
        }
    }
}

/// Observer seam for live consumers of the event stream.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}
