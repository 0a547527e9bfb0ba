use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docket_core::{JobId, JobRecord};

use crate::error::AnalysisError;

/// Input handed to the collaborator for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub task_id: JobId,
    pub file_ref: String,
    pub query: String,
}

impl From<&JobRecord> for AnalysisRequest {
    fn from(job: &JobRecord) -> Self {
        Self {
            task_id: job.id,
            file_ref: job.file_ref.clone(),
            query: job.query.clone(),
        }
    }
}

/// The external `Analyze(fileRef, query) -> (result, error)` routine.
///
/// Implementations may be called several times for the same job (retries,
/// redelivery) and must tolerate that. Latency is unbounded; callers impose
/// their own timeout.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;
}

#[async_trait]
impl<A> Analyzer for std::sync::Arc<A>
where
    A: Analyzer + ?Sized,
{
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        (**self).analyze(request).await
    }
}
