//! Errors surfaced to callers of the job system.

use docket_core::{DomainError, JobId, JobStatus};

use super::store::JobStoreError;

/// Job system error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The store could not be reached; nothing was recorded.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// The queue is at capacity; nothing was recorded.
    #[error("job queue is full")]
    QueueFull,

    /// The worker side of the queue has shut down.
    #[error("job queue is closed")]
    QueueClosed,

    /// `from` is `None` when the job does not exist.
    #[error("invalid transition for job {id}: cannot {action} {}", origin(.from))]
    InvalidTransition {
        id: JobId,
        from: Option<JobStatus>,
        action: &'static str,
    },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid request: {0}")]
    Validation(String),
}

impl JobError {
    /// Rejection for a lifecycle call on an id with no record.
    pub fn missing(id: JobId, action: &'static str) -> Self {
        JobError::InvalidTransition {
            id,
            from: None,
            action,
        }
    }
}

fn origin(from: &Option<JobStatus>) -> String {
    match from {
        Some(status) => format!("from {status}"),
        None => "a job that does not exist".to_string(),
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            other => JobError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { id, from, action } => {
                JobError::InvalidTransition {
                    id,
                    from: Some(from),
                    action,
                }
            }
            DomainError::Validation(msg) => JobError::Validation(msg),
            DomainError::InvalidId(msg) => JobError::Validation(msg),
        }
    }
}
