//! Crash-resumable run controller for an autonomous software-change agent.
//!
//! A run moves through plan, implement, verify, PR and review phases. Every
//! unit of work is a named step with idempotency bookkeeping and a heartbeat
//! lease, persisted in a per-run document, so a crashed or cancelled run
//! resumes exactly where it stopped instead of repeating side effects.

pub mod checkpoint;
pub mod collab;
pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod learning;
pub mod phase;
pub mod recovery;
pub mod review;
pub mod state;
pub mod util;
pub mod verify;

pub use config::RunConfig;
pub use controller::{Collaborators, RunController, RunOutcome};
pub use errors::{AgentError, AgentResult, ErrorKind};
pub use phase::Phase;
pub use state::store::RunStateStore;
