//! Fixed-size worker pool.
//!
//! Each worker loops: receive id → `on_pickup` → execute one attempt →
//! `on_outcome`. Workers hold no state between jobs; any worker may take any
//! id. Shutdown is only observed while idle, so an attempt that has started
//! always reports its outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docket_core::JobId;

use super::error::JobError;
use super::lifecycle::{JobLifecycle, Transition};
use super::queue::JobReceiver;
use super::retry::Executor;
use super::store::JobStore;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers (at least one is started)
    pub workers: usize,
    /// Name for logging
    pub name: String,
    /// How often to reclaim stale `processing` jobs (`None` = never)
    pub sweep_interval: Option<Duration>,
    /// Delay before re-sending an id whose pickup hit a store error
    pub redeliver_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            name: "docket-worker".to_string(),
            sweep_interval: None,
            redeliver_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    /// Attempts whose outcome was reported
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_requeued: u64,
    pub jobs_failed: u64,
    /// Deliveries dropped at pickup (duplicate, terminal or deleted job)
    pub deliveries_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct SharedStats {
    stats: Mutex<WorkerStats>,
    started: Instant,
}

impl SharedStats {
    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut s = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut s);
    }

    fn snapshot(&self) -> WorkerStats {
        let mut s = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        s.uptime_secs = self.started.elapsed().as_secs();
        s
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl WorkerPoolHandle {
    /// Stop taking new jobs and wait for in-flight attempts to report.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Cloneable read-only view of the statistics.
    pub fn stats_handle(&self) -> WorkerStatsHandle {
        WorkerStatsHandle {
            stats: self.stats.clone(),
        }
    }
}

/// Read-only statistics view that can be handed to other tasks.
#[derive(Debug, Clone)]
pub struct WorkerStatsHandle {
    stats: Arc<SharedStats>,
}

impl WorkerStatsHandle {
    pub fn get(&self) -> WorkerStats {
        self.stats.snapshot()
    }
}

#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn spawn<S, E>(
        lifecycle: Arc<JobLifecycle<S>>,
        executor: Arc<E>,
        receiver: JobReceiver,
        config: WorkerPoolConfig,
    ) -> WorkerPoolHandle
    where
        S: JobStore + 'static,
        E: Executor + ?Sized + 'static,
    {
        let workers = config.workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SharedStats {
            stats: Mutex::new(WorkerStats {
                workers,
                ..Default::default()
            }),
            started: Instant::now(),
        });

        let mut joins = Vec::with_capacity(workers + 1);
        for n in 0..workers {
            let worker = Worker {
                name: format!("{}-{n}", config.name),
                lifecycle: lifecycle.clone(),
                executor: executor.clone(),
                receiver: receiver.clone(),
                stats: stats.clone(),
                redeliver_delay: config.redeliver_delay,
            };
            joins.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        if let Some(interval) = config.sweep_interval {
            joins.push(tokio::spawn(sweep_loop(
                lifecycle,
                interval,
                shutdown_rx.clone(),
            )));
        }

        info!(pool = %config.name, workers, "worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

struct Worker<S, E: ?Sized> {
    name: String,
    lifecycle: Arc<JobLifecycle<S>>,
    executor: Arc<E>,
    receiver: JobReceiver,
    stats: Arc<SharedStats>,
    redeliver_delay: Duration,
}

impl<S, E> Worker<S, E>
where
    S: JobStore + 'static,
    E: Executor + ?Sized + 'static,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let id = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            self.process(id).await;
        }

        debug!(worker = %self.name, "worker stopped");
    }

    async fn process(&self, id: JobId) {
        let record = match self.lifecycle.on_pickup(id).await {
            Ok(record) => record,
            Err(err @ JobError::InvalidTransition { .. }) => {
                debug!(worker = %self.name, job_id = %id, reason = %err, "delivery skipped");
                self.stats.update(|s| s.deliveries_skipped += 1);
                return;
            }
            Err(err) => {
                error!(worker = %self.name, job_id = %id, error = %err, "pickup failed; re-sending");
                self.lifecycle.redeliver_after(id, self.redeliver_delay);
                return;
            }
        };

        let attempt = record.attempts;
        self.stats.update(|s| s.current_running += 1);
        let outcome = self.executor.execute(&record).await;
        let result = self.lifecycle.on_outcome(id, attempt, outcome).await;

        self.stats.update(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &result {
                Ok(Transition::Completed) => s.jobs_succeeded += 1,
                Ok(Transition::Requeued { .. }) => s.jobs_requeued += 1,
                Ok(Transition::Failed) => s.jobs_failed += 1,
                Ok(Transition::Stale) | Err(_) => {}
            }
        });

        if let Err(err) = result {
            // The attempt ran but its outcome could not be recorded; the job
            // stays `processing` until the stale sweep reclaims it.
            warn!(worker = %self.name, job_id = %id, attempt, error = %err, "outcome not recorded");
        }
    }
}

async fn sweep_loop<S: JobStore + 'static>(
    lifecycle: Arc<JobLifecycle<S>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; start-up recovery already covered it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = lifecycle.reclaim_stale().await {
                    warn!(error = %err, "stale job sweep failed");
                }
            }
        }
    }
}
