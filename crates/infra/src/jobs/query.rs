//! Read and delete access to job history.

use docket_core::{JobId, JobRecord, JobStatus, JobStatusView};
use tracing::info;

use super::error::JobError;
use super::store::{JobFilter, JobStats, JobStore};

/// Page size used when none (or zero) is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
/// Largest page a caller can ask for.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Resolve a caller-supplied page size.
pub fn clamp_limit(limit: Option<usize>) -> usize {
    match limit {
        None | Some(0) => DEFAULT_HISTORY_LIMIT,
        Some(n) => n.min(MAX_HISTORY_LIMIT),
    }
}

/// Projection over the job store. Only `delete_one` mutates.
#[derive(Debug, Clone)]
pub struct QueryService<S> {
    store: S,
}

impl<S: JobStore> QueryService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Newest-first history, optionally restricted to one status.
    pub async fn get_history(
        &self,
        limit: Option<usize>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>, JobError> {
        let filter = JobFilter { status };
        Ok(self.store.list(filter, clamp_limit(limit)).await?)
    }

    pub async fn get_one(&self, id: JobId) -> Result<JobRecord, JobError> {
        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatusView, JobError> {
        Ok(self.get_one(id).await?.status_view())
    }

    pub async fn delete_one(&self, id: JobId) -> Result<(), JobError> {
        self.store.delete(id).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    pub async fn stats(&self) -> Result<JobStats, JobError> {
        Ok(self.store.stats().await?)
    }
}
