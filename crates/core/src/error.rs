//! Domain error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of the job state machine and
/// input validation. Storage and transport concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition was attempted that the state machine does not allow.
    #[error("invalid transition for job {id}: cannot {action} from {from}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        action: &'static str,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(id: JobId, from: JobStatus, action: &'static str) -> Self {
        Self::InvalidTransition { id, from, action }
    }
}
