//! Asynchronous job system: submission, queueing, bounded retry and history.
//!
//! ## Design
//!
//! - The store is the only shared mutable state; every write is a
//!   compare-and-swap on `(status, attempts)`
//! - The queue carries ids only and is bounded (backpressure on submit)
//! - Workers run one attempt per delivery and report the outcome back
//! - Failed attempts are re-queued with backoff until the ceiling is hit
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or SQLite)
//! - `JobQueue` / `JobReceiver`: bounded id channel
//! - `RetryController`: one collaborator call under a deadline
//! - `JobLifecycle`: owns every status transition
//! - `WorkerPool`: fixed set of workers draining the queue
//! - `QueryService`: history reads and deletes
//! - `JobSystem`: wires all of the above

pub mod error;
pub mod lifecycle;
pub mod query;
pub mod queue;
pub mod retry;
pub mod sqlite;
pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use docket_analysis::Analyzer;

pub use error::JobError;
pub use lifecycle::{JobEvent, JobLifecycle, RecoveryReport, SubmitRequest, Transition};
pub use query::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, QueryService, clamp_limit};
pub use queue::{JobQueue, JobReceiver};
pub use retry::{AttemptOutcome, BackoffStrategy, Executor, RetryController, RetryPolicy};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats, WorkerStatsHandle};

/// Type-erased store shared by the binary and its routes.
pub type SharedJobStore = Arc<dyn JobStore>;

/// Job system configuration.
#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub policy: RetryPolicy,
    /// Age after which a `processing` job is considered abandoned
    pub stale_after: Duration,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            policy: RetryPolicy::default(),
            stale_after: Duration::from_secs(900),
        }
    }
}

impl JobSystemConfig {
    /// A `processing` record must not look stale while its attempt can still
    /// be running, or the sweep would hand it to a second worker.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.stale_after <= self.policy.attempt_timeout {
            return Err(JobError::Validation(format!(
                "stale_after ({:?}) must be greater than the attempt timeout ({:?})",
                self.stale_after, self.policy.attempt_timeout
            )));
        }
        Ok(())
    }
}

/// A running job system.
#[derive(Debug)]
pub struct JobSystem<S> {
    lifecycle: Arc<JobLifecycle<S>>,
    query: QueryService<S>,
    workers: WorkerPoolHandle,
}

impl<S> JobSystem<S>
where
    S: JobStore + Clone + 'static,
{
    /// Start the workers on the current runtime, then run the recovery sweep
    /// so jobs left behind by a previous process are picked up again.
    pub async fn start<A: Analyzer>(
        store: S,
        analyzer: A,
        config: JobSystemConfig,
    ) -> Result<Self, JobError> {
        config.validate()?;

        let (queue, receiver) = queue::channel(config.queue_capacity);
        let lifecycle = Arc::new(JobLifecycle::new(
            store.clone(),
            queue,
            config.policy.clone(),
            config.stale_after,
        ));
        let executor = Arc::new(RetryController::new(analyzer, config.policy));

        let workers = WorkerPool::spawn(
            lifecycle.clone(),
            executor,
            receiver,
            WorkerPoolConfig::default()
                .with_workers(config.workers)
                .with_sweep_interval(config.stale_after),
        );

        lifecycle.recover().await?;

        Ok(Self {
            lifecycle,
            query: QueryService::new(store),
            workers,
        })
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle<S>> {
        &self.lifecycle
    }

    pub fn query(&self) -> &QueryService<S> {
        &self.query
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }

    pub fn worker_stats_handle(&self) -> WorkerStatsHandle {
        self.workers.stats_handle()
    }

    /// Stop the workers, letting in-flight attempts report first.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}
