//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use docket_core::{ExpectedState, JobId, JobRecord, JobStatus};

/// Filter for listing jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
    }
}

/// Durable mapping from job id to job record.
///
/// Implementations must be safe under concurrent callers. `update` is a
/// compare-and-swap: it only lands when the stored record still matches the
/// `expected` status and attempt count, so a slow writer can never overwrite
/// a newer transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` on a duplicate id.
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    /// Replace the stored record with `record` if it still matches `expected`.
    async fn update(&self, record: &JobRecord, expected: ExpectedState) -> Result<(), JobStoreError>;

    /// Get a record by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// List records matching `filter`, newest first by `created_at`.
    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Delete a record. Fails with `NotFound` when absent.
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Count records per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: ExpectedState,
        actual: ExpectedState,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed
    }
}

/// In-memory job store for tests/dev.
///
/// The map lock is only held to find a record; each record has its own lock,
/// so writes to different jobs do not contend with each other.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobRecord>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn entry(&self, id: JobId) -> Result<Option<Arc<Mutex<JobRecord>>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    fn snapshot(&self) -> Result<Vec<JobRecord>, JobStoreError> {
        let entries: Vec<_> = {
            let jobs = self.jobs.read().map_err(|_| poisoned())?;
            jobs.values().cloned().collect()
        };
        entries
            .iter()
            .map(|e| e.lock().map(|r| r.clone()).map_err(|_| poisoned()))
            .collect()
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&record.id) {
            return Err(JobStoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, Arc::new(Mutex::new(record.clone())));
        Ok(())
    }

    async fn update(&self, record: &JobRecord, expected: ExpectedState) -> Result<(), JobStoreError> {
        let entry = self
            .entry(record.id)?
            .ok_or(JobStoreError::NotFound(record.id))?;
        let mut current = entry.lock().map_err(|_| poisoned())?;

        if !expected.matches(&current) {
            return Err(JobStoreError::Conflict {
                id: record.id,
                expected,
                actual: current.expected(),
            });
        }
        *current = record.clone();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        match self.entry(id)? {
            Some(entry) => Ok(Some(entry.lock().map_err(|_| poisoned())?.clone())),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut result: Vec<_> = self
            .snapshot()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();

        // Newest first; ids are time-ordered so they break timestamp ties.
        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.remove(&id).map(|_| ()).ok_or(JobStoreError::NotFound(id))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for record in self.snapshot()? {
            stats.record(record.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        (**self).create(record).await
    }

    async fn update(&self, record: &JobRecord, expected: ExpectedState) -> Result<(), JobStoreError> {
        (**self).update(record, expected).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list(filter, limit).await
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
