//! Job lifecycle manager.
//!
//! Owns every status transition. Workers and submitters never write records
//! themselves; they call into this type, which reads the current record,
//! applies the transition on a copy and writes it back with a
//! compare-and-swap against the state it read.
//!
//! ## Flow
//!
//! ```text
//! submit ──create(queued)──> store ──id──> queue
//! worker ──on_pickup──> processing, attempts += 1
//! worker ──on_outcome──> completed | queued (re-sent after backoff) | failed
//! ```
//!
//! Every successful transition is broadcast as a [`JobEvent`].

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use docket_core::{JobId, JobRecord, JobStatus};

use super::error::JobError;
use super::queue::{JobQueue, QueueSlot};
use super::retry::{AttemptOutcome, RetryPolicy};
use super::store::{JobFilter, JobStore, JobStoreError};

const EVENT_BUFFER: usize = 1024;

/// A submission as handed over by the upload side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitRequest {
    pub file_ref: String,
    pub query: Option<String>,
    pub filename: Option<String>,
}

impl SubmitRequest {
    pub fn new(query: Option<&str>, file_ref: impl Into<String>) -> Self {
        Self {
            file_ref: file_ref.into(),
            query: query.map(str::to_string),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Broadcast after each applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        task_id: JobId,
    },
    Processing {
        task_id: JobId,
        attempt: u32,
    },
    Requeued {
        task_id: JobId,
        attempt: u32,
        error: String,
        retry_in_ms: u64,
    },
    Completed {
        task_id: JobId,
        attempt: u32,
    },
    Failed {
        task_id: JobId,
        attempt: u32,
        error: String,
    },
}

impl JobEvent {
    pub fn task_id(&self) -> JobId {
        match self {
            JobEvent::Queued { task_id }
            | JobEvent::Processing { task_id, .. }
            | JobEvent::Requeued { task_id, .. }
            | JobEvent::Completed { task_id, .. }
            | JobEvent::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }

    /// The serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "queued",
            JobEvent::Processing { .. } => "processing",
            JobEvent::Requeued { .. } => "requeued",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
        }
    }
}

/// What `on_outcome` did with a reported outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Completed,
    /// Back to `queued`; the id is re-sent after `retry_in`.
    Requeued {
        retry_in: Duration,
    },
    Failed,
    /// The outcome was for an attempt that is no longer current. Nothing written.
    Stale,
}

/// Counts from a recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `queued` records handed back to the queue.
    pub redelivered: usize,
    /// Stale `processing` records returned to `queued`.
    pub reclaimed: usize,
    /// Stale `processing` records with no attempts left, now `failed`.
    pub abandoned: usize,
}

pub struct JobLifecycle<S> {
    store: S,
    queue: JobQueue,
    policy: RetryPolicy,
    stale_after: chrono::Duration,
    events: broadcast::Sender<JobEvent>,
}

impl<S> std::fmt::Debug for JobLifecycle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycle")
            .field("policy", &self.policy)
            .field("stale_after", &self.stale_after)
            .field("queue_depth", &self.queue.depth())
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> JobLifecycle<S> {
    pub fn new(store: S, queue: JobQueue, policy: RetryPolicy, stale_after: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            queue,
            policy,
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX),
            events,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Receive every transition applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Record a new job and queue it. Fails fast with `QueueFull` when the
    /// queue is at capacity; nothing is written in that case.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, JobError> {
        let record = new_record(request)?;
        let slot = self.queue.try_reserve()?;
        self.admit(record, slot).await
    }

    /// Like [`submit`](Self::submit) but waits up to `max_wait` for queue
    /// capacity before giving up with `QueueFull`.
    pub async fn submit_wait(
        &self,
        request: SubmitRequest,
        max_wait: Duration,
    ) -> Result<JobId, JobError> {
        let record = new_record(request)?;
        let slot = tokio::time::timeout(max_wait, self.queue.reserve())
            .await
            .map_err(|_| JobError::QueueFull)??;
        self.admit(record, slot).await
    }

    async fn admit(&self, record: JobRecord, slot: QueueSlot) -> Result<JobId, JobError> {
        // The slot is released on error, so a failed write leaves no queue entry.
        self.store.create(&record).await?;
        slot.send(record.id);

        info!(job_id = %record.id, file_ref = %record.file_ref, "job queued");
        self.emit(JobEvent::Queued { task_id: record.id });
        Ok(record.id)
    }

    /// Claim a delivered job for one attempt: `queued -> processing`.
    ///
    /// Rejects with `InvalidTransition` when the job does not exist, is
    /// terminal, is already held by a live worker, or is out of attempts.
    pub async fn on_pickup(&self, id: JobId) -> Result<JobRecord, JobError> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| JobError::missing(id, "pick up"))?;
        let expected = record.expected();

        if let Err(err) = record.mark_processing(Utc::now(), self.policy.max_attempts(), self.stale_after) {
            debug!(job_id = %id, status = %expected.status, attempts = expected.attempts, "pickup rejected");
            return Err(err.into());
        }

        match self.store.update(&record, expected).await {
            Ok(()) => {}
            Err(JobStoreError::Conflict { actual, .. }) => {
                debug!(job_id = %id, found = %actual, "pickup lost the race");
                return Err(JobError::InvalidTransition {
                    id,
                    from: Some(actual.status),
                    action: "pick up",
                });
            }
            Err(JobStoreError::NotFound(_)) => return Err(JobError::missing(id, "pick up")),
            Err(err) => return Err(err.into()),
        }

        info!(job_id = %id, attempt = record.attempts, "job processing");
        self.emit(JobEvent::Processing {
            task_id: id,
            attempt: record.attempts,
        });
        Ok(record)
    }

    /// Apply the outcome of `attempt`.
    ///
    /// Success completes the job. A failure re-queues while the policy allows
    /// another attempt and fails the job otherwise. Outcomes for any attempt
    /// other than the one in flight are ignored, so repeated or late reports
    /// never double-apply. A terminal job rejects any other attempt with
    /// `InvalidTransition`.
    pub async fn on_outcome(
        &self,
        id: JobId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Result<Transition, JobError> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| JobError::missing(id, "apply outcome"))?;

        if record.is_terminal() && record.attempts == attempt {
            debug!(job_id = %id, attempt, status = %record.status, "outcome already applied");
            return Ok(Transition::Stale);
        }
        if record.is_terminal() {
            warn!(job_id = %id, status = %record.status, attempt, "outcome for terminal job rejected");
            return Err(JobError::InvalidTransition {
                id,
                from: Some(record.status),
                action: "apply outcome",
            });
        }
        if record.status != JobStatus::Processing || record.attempts != attempt {
            debug!(
                job_id = %id,
                attempt,
                current_attempt = record.attempts,
                status = %record.status,
                "ignoring outcome for superseded attempt"
            );
            return Ok(Transition::Stale);
        }

        let expected = record.expected();
        let now = Utc::now();
        let (transition, event) = match outcome {
            AttemptOutcome::Succeeded(result) => {
                record.mark_completed(result, now)?;
                (
                    Transition::Completed,
                    JobEvent::Completed {
                        task_id: id,
                        attempt,
                    },
                )
            }
            AttemptOutcome::Failed(err) if self.policy.should_retry(record.attempts) => {
                record.requeue(now)?;
                let retry_in = self.policy.delay_for_attempt(attempt);
                (
                    Transition::Requeued { retry_in },
                    JobEvent::Requeued {
                        task_id: id,
                        attempt,
                        error: err.to_string(),
                        retry_in_ms: u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                    },
                )
            }
            AttemptOutcome::Failed(err) => {
                let error = err.to_string();
                record.mark_failed(error.clone(), now)?;
                (
                    Transition::Failed,
                    JobEvent::Failed {
                        task_id: id,
                        attempt,
                        error,
                    },
                )
            }
        };

        match self.store.update(&record, expected).await {
            Ok(()) => {}
            Err(JobStoreError::Conflict { actual, .. }) => {
                debug!(job_id = %id, attempt, found = %actual, "outcome lost the race");
                return Ok(Transition::Stale);
            }
            Err(JobStoreError::NotFound(_)) => return Err(JobError::missing(id, "apply outcome")),
            Err(err) => return Err(err.into()),
        }

        match &event {
            JobEvent::Completed { .. } => {
                info!(job_id = %id, attempt, duration_seconds = ?record.duration_seconds, "job completed");
            }
            JobEvent::Requeued { error, retry_in_ms, .. } => {
                warn!(job_id = %id, attempt, error = %error, retry_in_ms, "attempt failed; job re-queued");
            }
            JobEvent::Failed { error, .. } => {
                warn!(job_id = %id, attempt, error = %error, "job failed; attempts exhausted");
            }
            _ => {}
        }
        self.emit(event);

        if let Transition::Requeued { retry_in } = transition {
            self.redeliver_after(id, retry_in);
        }
        Ok(transition)
    }

    /// Re-send `id` to the queue once `delay` has passed.
    pub fn redeliver_after(&self, id: JobId, delay: Duration) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = queue.send(id).await {
                warn!(job_id = %id, error = %err, "could not re-send job; it will be picked up by recovery");
            }
        });
    }

    /// Start-up sweep: hand every `queued` record back to the queue, then
    /// reclaim stale `processing` records.
    ///
    /// Workers must already be consuming, or a backlog larger than the queue
    /// capacity blocks here.
    pub async fn recover(&self) -> Result<RecoveryReport, JobError> {
        let mut queued = self
            .store
            .list(JobFilter::status(JobStatus::Queued), usize::MAX)
            .await?;
        // Oldest first.
        queued.reverse();

        let mut report = RecoveryReport::default();
        for record in &queued {
            if !record.has_attempts_left(self.policy.max_attempts()) {
                warn!(job_id = %record.id, attempts = record.attempts, "queued job has no attempts left; leaving it");
                continue;
            }
            self.queue.send(record.id).await?;
            report.redelivered += 1;
        }

        let reclaimed = self.reclaim_stale().await?;
        report.reclaimed = reclaimed.reclaimed;
        report.abandoned = reclaimed.abandoned;

        info!(
            redelivered = report.redelivered,
            reclaimed = report.reclaimed,
            abandoned = report.abandoned,
            "recovery sweep finished"
        );
        Ok(report)
    }

    /// Return `processing` records nobody has touched for `stale_after` to
    /// the queue, or fail them when they have no attempts left.
    pub async fn reclaim_stale(&self) -> Result<RecoveryReport, JobError> {
        let now = Utc::now();
        let processing = self
            .store
            .list(JobFilter::status(JobStatus::Processing), usize::MAX)
            .await?;

        let mut report = RecoveryReport::default();
        for mut record in processing {
            if !record.is_stale(now, self.stale_after) {
                continue;
            }
            let id = record.id;
            let attempt = record.attempts;
            let expected = record.expected();

            let event = if record.has_attempts_left(self.policy.max_attempts()) {
                record.requeue(now)?;
                JobEvent::Requeued {
                    task_id: id,
                    attempt,
                    error: "worker stopped responding".to_string(),
                    retry_in_ms: 0,
                }
            } else {
                let error = format!("abandoned after {attempt} attempts: worker stopped responding");
                record.mark_failed(error.clone(), now)?;
                JobEvent::Failed {
                    task_id: id,
                    attempt,
                    error,
                }
            };

            match self.store.update(&record, expected).await {
                Ok(()) => {}
                Err(JobStoreError::Conflict { .. } | JobStoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }

            if record.status == JobStatus::Queued {
                warn!(job_id = %id, attempt, "stale job reclaimed");
                self.queue.send(id).await?;
                report.reclaimed += 1;
            } else {
                warn!(job_id = %id, attempt, "stale job abandoned");
                report.abandoned += 1;
            }
            self.emit(event);
        }
        Ok(report)
    }

    /// Wait until the job is terminal, up to `timeout`.
    ///
    /// Returns `Ok(None)` when the deadline passes first.
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<Option<JobRecord>, JobError> {
        // Subscribe before reading so a transition in between is not missed.
        let mut events = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let record = self.store.get(id).await?.ok_or(JobError::NotFound(id))?;
            if record.is_terminal() {
                return Ok(Some(record));
            }

            // Wait for a terminal event for this job, then re-read the store.
            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return Ok(None),
                    Ok(Ok(event)) if event.task_id() == id && event.is_terminal() => break,
                    Ok(Ok(_)) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                    Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                }
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn new_record(request: SubmitRequest) -> Result<JobRecord, JobError> {
    Ok(JobRecord::new(request.query.as_deref(), request.file_ref)?.with_filename(request.filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::{self, JobReceiver};
    use crate::jobs::store::InMemoryJobStore;
    use docket_analysis::AnalysisError;
    use std::sync::Arc;

    type Lifecycle = JobLifecycle<Arc<InMemoryJobStore>>;

    fn lifecycle_with(capacity: usize, max_retries: u32) -> (Lifecycle, JobReceiver) {
        let (queue, receiver) = queue::channel(capacity);
        let policy = RetryPolicy::fixed(max_retries, Duration::ZERO);
        let lifecycle = JobLifecycle::new(
            InMemoryJobStore::arc(),
            queue,
            policy,
            Duration::from_secs(900),
        );
        (lifecycle, receiver)
    }

    fn failure() -> AttemptOutcome {
        AttemptOutcome::Failed(AnalysisError::failed("boom"))
    }

    async fn next(receiver: &JobReceiver) -> JobId {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("queue delivery")
            .expect("queue open")
    }

    #[tokio::test]
    async fn submit_records_then_queues() {
        let (lifecycle, receiver) = lifecycle_with(4, 2);
        let mut events = lifecycle.subscribe();

        let id = lifecycle
            .submit(SubmitRequest::new(Some("test"), "f1").with_filename("q3.pdf"))
            .await
            .unwrap();

        let record = lifecycle.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.filename.as_deref(), Some("q3.pdf"));
        assert_eq!(next(&receiver).await, id);
        assert_eq!(events.recv().await.unwrap(), JobEvent::Queued { task_id: id });
    }

    #[tokio::test]
    async fn blank_file_ref_is_rejected_before_anything_is_written() {
        let (lifecycle, _receiver) = lifecycle_with(4, 2);
        let err = lifecycle.submit(SubmitRequest::new(None, "  ")).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(lifecycle.store().stats().await.unwrap().total(), 0);
        assert_eq!(lifecycle.queue().depth(), 0);
    }

    #[tokio::test]
    async fn full_queue_leaves_no_orphan_record() {
        let (lifecycle, _receiver) = lifecycle_with(1, 2);
        lifecycle.submit(SubmitRequest::new(None, "a")).await.unwrap();

        let err = lifecycle.submit(SubmitRequest::new(None, "b")).await.unwrap_err();
        assert!(matches!(err, JobError::QueueFull));

        let stats = lifecycle.store().stats().await.unwrap();
        assert_eq!(stats.total(), 1);
        assert_eq!(lifecycle.queue().depth(), 1);
    }

    #[tokio::test]
    async fn submit_wait_blocks_until_capacity_frees() {
        let (lifecycle, receiver) = lifecycle_with(1, 2);
        let lifecycle = Arc::new(lifecycle);
        let first = lifecycle.submit(SubmitRequest::new(None, "a")).await.unwrap();

        let waiting = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                lifecycle
                    .submit_wait(SubmitRequest::new(None, "b"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        assert_eq!(next(&receiver).await, first);
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(next(&receiver).await, second);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_wait_gives_up_when_queue_stays_full() {
        let (lifecycle, _receiver) = lifecycle_with(1, 2);
        lifecycle.submit(SubmitRequest::new(None, "a")).await.unwrap();

        let err = lifecycle
            .submit_wait(SubmitRequest::new(None, "b"), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::QueueFull));
        assert_eq!(lifecycle.store().stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let (lifecycle, receiver) = lifecycle_with(4, 2);
        let id = lifecycle.submit(SubmitRequest::new(Some("test"), "f1")).await.unwrap();

        for attempt in 1..=2 {
            assert_eq!(next(&receiver).await, id);
            let picked = lifecycle.on_pickup(id).await.unwrap();
            assert_eq!(picked.status, JobStatus::Processing);
            assert_eq!(picked.attempts, attempt);

            let t = lifecycle.on_outcome(id, attempt, failure()).await.unwrap();
            assert!(matches!(t, Transition::Requeued { .. }));
            let record = lifecycle.store().get(id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Queued);
            assert!(record.error_message.is_none());
        }

        assert_eq!(next(&receiver).await, id);
        lifecycle.on_pickup(id).await.unwrap();
        let t = lifecycle
            .on_outcome(id, 3, AttemptOutcome::Succeeded("third time".into()))
            .await
            .unwrap();
        assert_eq!(t, Transition::Completed);

        let record = lifecycle.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.result.as_deref(), Some("third time"));
        assert!(record.error_message.is_none());
        assert!(record.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn fails_every_attempt() {
        let (lifecycle, receiver) = lifecycle_with(4, 2);
        let id = lifecycle.submit(SubmitRequest::new(None, "f2")).await.unwrap();

        let mut last = Transition::Stale;
        for attempt in 1..=3 {
            assert_eq!(next(&receiver).await, id);
            lifecycle.on_pickup(id).await.unwrap();
            last = lifecycle.on_outcome(id, attempt, failure()).await.unwrap();
        }
        assert_eq!(last, Transition::Failed);

        let record = lifecycle.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error_message.as_deref().unwrap().contains("boom"));
        assert!(record.result.is_none());

        // Nothing else gets queued once failed.
        tokio::task::yield_now().await;
        assert_eq!(lifecycle.queue().depth(), 0);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_pickup_and_outcome() {
        let (lifecycle, receiver) = lifecycle_with(4, 0);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();
        next(&receiver).await;
        lifecycle.on_pickup(id).await.unwrap();
        lifecycle
            .on_outcome(id, 1, AttemptOutcome::Succeeded("done".into()))
            .await
            .unwrap();
        let before = lifecycle.store().get(id).await.unwrap();

        assert!(matches!(
            lifecycle.on_pickup(id).await,
            Err(JobError::InvalidTransition { from: Some(JobStatus::Completed), .. })
        ));
        assert_eq!(
            lifecycle.on_outcome(id, 1, failure()).await.unwrap(),
            Transition::Stale
        );
        assert!(matches!(
            lifecycle.on_outcome(id, 2, failure()).await,
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(lifecycle.store().get(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_job_rejects_pickup_and_outcome() {
        let (lifecycle, _receiver) = lifecycle_with(4, 2);
        let id = JobId::new();

        let err = lifecycle.on_pickup(id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition { id: got, from: None, action: "pick up" } if got == id
        ));
        assert!(err.to_string().contains("does not exist"));

        assert!(matches!(
            lifecycle.on_outcome(id, 1, failure()).await,
            Err(JobError::InvalidTransition { from: None, .. })
        ));
        assert!(lifecycle.store().get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_rejected_while_in_flight() {
        let (lifecycle, _receiver) = lifecycle_with(4, 2);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();

        lifecycle.on_pickup(id).await.unwrap();
        assert!(matches!(
            lifecycle.on_pickup(id).await,
            Err(JobError::InvalidTransition { from: Some(JobStatus::Processing), .. })
        ));
        assert_eq!(lifecycle.store().get(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn repeated_outcome_for_same_attempt_is_a_no_op() {
        let (lifecycle, receiver) = lifecycle_with(4, 2);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();
        next(&receiver).await;
        lifecycle.on_pickup(id).await.unwrap();

        let first = lifecycle.on_outcome(id, 1, failure()).await.unwrap();
        assert!(matches!(first, Transition::Requeued { .. }));
        let second = lifecycle.on_outcome(id, 1, failure()).await.unwrap();
        assert_eq!(second, Transition::Stale);

        let record = lifecycle.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn concurrent_outcomes_produce_one_terminal_write() {
        let (lifecycle, _receiver) = lifecycle_with(4, 0);
        let lifecycle = Arc::new(lifecycle);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();
        lifecycle.on_pickup(id).await.unwrap();
        let mut events = lifecycle.subscribe();

        let mut handles = Vec::new();
        for attempt in 0..8u32 {
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                let outcome = if attempt % 2 == 0 {
                    AttemptOutcome::Succeeded(format!("result {attempt}"))
                } else {
                    failure()
                };
                // Half report the in-flight attempt, half a wrong one.
                let reported = if attempt < 4 { 1 } else { attempt };
                lifecycle.on_outcome(id, reported, outcome).await
            }));
        }

        let mut terminal_writes = 0;
        for h in handles {
            if let Ok(Transition::Completed | Transition::Failed) = h.await.unwrap() {
                terminal_writes += 1;
            }
        }
        assert_eq!(terminal_writes, 1);

        let mut terminal_events = 0;
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                terminal_events += 1;
            }
        }
        assert_eq!(terminal_events, 1);
        assert!(lifecycle.store().get(id).await.unwrap().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn recover_redelivers_queued_and_reclaims_stale() {
        let (queue, receiver) = queue::channel(8);
        let store = InMemoryJobStore::arc();
        let lifecycle = JobLifecycle::new(
            store.clone(),
            queue,
            RetryPolicy::fixed(1, Duration::ZERO),
            Duration::from_secs(60),
        );

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        let waiting = JobRecord::new(None, "waiting").unwrap();
        store.create(&waiting).await.unwrap();

        let mut stale = JobRecord::new(None, "stale").unwrap();
        stale.mark_processing(long_ago, 2, chrono::Duration::minutes(1)).unwrap();
        store.create(&stale).await.unwrap();

        let mut exhausted = JobRecord::new(None, "exhausted").unwrap();
        exhausted.mark_processing(long_ago, 2, chrono::Duration::minutes(1)).unwrap();
        exhausted.requeue(long_ago).unwrap();
        exhausted.mark_processing(long_ago, 2, chrono::Duration::minutes(1)).unwrap();
        store.create(&exhausted).await.unwrap();

        let mut fresh = JobRecord::new(None, "fresh").unwrap();
        fresh.mark_processing(Utc::now(), 2, chrono::Duration::minutes(1)).unwrap();
        store.create(&fresh).await.unwrap();

        let report = lifecycle.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                redelivered: 1,
                reclaimed: 1,
                abandoned: 1,
            }
        );

        assert_eq!(next(&receiver).await, waiting.id);
        assert_eq!(next(&receiver).await, stale.id);

        let stale_now = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(stale_now.status, JobStatus::Queued);
        assert_eq!(stale_now.attempts, 1);

        let exhausted_now = store.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted_now.status, JobStatus::Failed);
        assert!(exhausted_now.error_message.unwrap().contains("abandoned"));

        assert_eq!(
            store.get(fresh.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn wait_for_terminal_returns_finished_record() {
        let (lifecycle, _receiver) = lifecycle_with(4, 0);
        let lifecycle = Arc::new(lifecycle);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for_terminal(id, Duration::from_secs(5)).await })
        };

        lifecycle.on_pickup(id).await.unwrap();
        lifecycle
            .on_outcome(id, 1, AttemptOutcome::Succeeded("ok".into()))
            .await
            .unwrap();

        let record = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_terminal_times_out_on_unfinished_job() {
        let (lifecycle, _receiver) = lifecycle_with(4, 0);
        let id = lifecycle.submit(SubmitRequest::new(None, "f")).await.unwrap();

        let waited = lifecycle
            .wait_for_terminal(id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(waited.is_none());

        assert!(matches!(
            lifecycle.wait_for_terminal(JobId::new(), Duration::from_secs(1)).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let id = JobId::new();
        let json = serde_json::to_value(JobEvent::Processing {
            task_id: id,
            attempt: 2,
        })
        .unwrap();
        assert_eq!(json["event"], "processing");
        assert_eq!(json["event"], JobEvent::Processing { task_id: id, attempt: 2 }.kind());
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["task_id"], id.to_string());
    }
}
