use std::time::Duration;

use thiserror::Error;

/// Failure of a single analysis attempt.
///
/// All variants count as a failed attempt for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    /// The collaborator ran and reported an error.
    #[error("analysis failed: {0}")]
    Failed(String),

    /// The attempt was abandoned after the per-attempt timeout.
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator could not be reached.
    #[error("analyzer unreachable: {0}")]
    Transport(String),

    /// The collaborator answered with something we cannot interpret.
    #[error("invalid analyzer response: {0}")]
    InvalidResponse(String),
}

impl AnalysisError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
