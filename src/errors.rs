//! Typed error taxonomy for the run controller.
//!
//! Every error carries a stable machine-readable code, a user-facing message,
//! and optional remediation steps. The taxonomy maps onto process exit codes:
//! `canceled` → 130, `expected` ("needs human input") → 0, everything else → 1.

use thiserror::Error;

/// Coarse classification of an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-actionable condition (missing clarifications, disabled provider).
    Expected,
    /// Schema mismatch on cognition output or persisted state.
    Validation,
    /// Missing or invalid credentials.
    Auth,
    NotFound,
    Conflict,
    Canceled,
    /// Unexpected failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Expected => "expected",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors surfaced by the run controller and its orchestrators.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{message}")]
    Expected {
        code: &'static str,
        message: String,
        remediation: Vec<String>,
    },

    #[error("validation failed ({code}): {message}")]
    Validation { code: &'static str, message: String },

    #[error("authentication required: {message}")]
    Auth { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("run canceled")]
    Canceled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    /// A user-actionable stop with a stable code.
    pub fn expected(code: &'static str, message: impl Into<String>) -> Self {
        AgentError::Expected {
            code,
            message: message.into(),
            remediation: Vec::new(),
        }
    }

    pub fn expected_with_remediation(
        code: &'static str,
        message: impl Into<String>,
        remediation: Vec<String>,
    ) -> Self {
        AgentError::Expected {
            code,
            message: message.into(),
            remediation,
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        AgentError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AgentError::NotFound { what: what.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        AgentError::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AgentError::Internal(anyhow::anyhow!(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Expected { .. } => ErrorKind::Expected,
            AgentError::Validation { .. } => ErrorKind::Validation,
            AgentError::Auth { .. } => ErrorKind::Auth,
            AgentError::NotFound { .. } => ErrorKind::NotFound,
            AgentError::Conflict { .. } => ErrorKind::Conflict,
            AgentError::Canceled => ErrorKind::Canceled,
            AgentError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for persistence and audit records.
    pub fn code(&self) -> &str {
        match self {
            AgentError::Expected { code, .. } => code,
            AgentError::Validation { code, .. } => code,
            AgentError::Auth { .. } => "auth_required",
            AgentError::NotFound { .. } => "not_found",
            AgentError::Conflict { .. } => "conflict",
            AgentError::Canceled => "canceled",
            AgentError::Internal(_) => "internal",
        }
    }

    /// Process exit code this error maps to.
    ///
    /// Expected errors represent "needs human input" rather than true failure,
    /// so they exit cleanly. Cancellation follows the shell convention for
    /// SIGINT-terminated processes.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Expected => 0,
            ErrorKind::Canceled => 130,
            _ => 1,
        }
    }

    pub fn remediation(&self) -> &[String] {
        match self {
            AgentError::Expected { remediation, .. } => remediation,
            _ => &[],
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
