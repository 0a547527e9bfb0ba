//! Job record and its status state machine.
//!
//! ```text
//! queued --pickup--> processing --success--> completed
//!                    processing --failure, attempts left--> queued
//!                    processing --failure, no attempts left--> failed
//! ```
//!
//! `completed` and `failed` are terminal. Every transition method refuses to
//! leave a terminal state and returns `DomainError::InvalidTransition` instead.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Prompt used when the caller submits no (or a blank) query.
pub const DEFAULT_QUERY: &str = "Analyze this financial document for investment insights";

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue (first submission or re-queued after a failure).
    Queued,
    /// Picked up by a worker; an attempt is in flight.
    Processing,
    /// Finished with a result. Terminal.
    Completed,
    /// Exhausted all attempts. Terminal.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown job status '{other}' (expected queued, processing, completed or failed)"
            ))),
        }
    }
}

/// Compare-and-swap precondition for a store update.
///
/// A write carrying this expectation only lands if the stored record still has
/// exactly this status and attempt count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedState {
    pub status: JobStatus,
    pub attempts: u32,
}

impl ExpectedState {
    pub fn new(status: JobStatus, attempts: u32) -> Self {
        Self { status, attempts }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        record.status == self.status && record.attempts == self.attempts
    }
}

impl core::fmt::Display for ExpectedState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}", self.status, self.attempts)
    }
}

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub query: String,
    /// Handle to the uploaded artifact; never opened by the core.
    pub file_ref: String,
    /// Original name of the uploaded artifact, for display.
    pub filename: Option<String>,
    /// Set only when `status == Completed`.
    pub result: Option<String>,
    /// Set only when `status == Failed`.
    pub error_message: Option<String>,
    /// Attempts started so far (0 until first pickup).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current (or last) attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl JobRecord {
    /// Create a freshly submitted job (status `queued`, no attempts).
    ///
    /// The query is trimmed; a missing or blank query falls back to
    /// [`DEFAULT_QUERY`]. The file reference must be non-blank.
    pub fn new(query: Option<&str>, file_ref: impl Into<String>) -> DomainResult<Self> {
        Self::new_at(JobId::new(), query, file_ref, Utc::now())
    }

    /// Like [`JobRecord::new`] with an explicit id and clock (tests, imports).
    pub fn new_at(
        id: JobId,
        query: Option<&str>,
        file_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let file_ref = file_ref.into();
        if file_ref.trim().is_empty() {
            return Err(DomainError::validation("file_ref must not be empty"));
        }

        let query = match query.map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => DEFAULT_QUERY.to_string(),
        };

        Ok(Self {
            id,
            status: JobStatus::Queued,
            query,
            file_ref,
            filename: None,
            result: None,
            error_message: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
        })
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename.filter(|f| !f.trim().is_empty());
        self
    }

    /// The precondition that matches this record as currently observed.
    pub fn expected(&self) -> ExpectedState {
        ExpectedState::new(self.status, self.attempts)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an in-flight record has gone without a transition for longer
    /// than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == JobStatus::Processing && now - self.updated_at >= stale_after
    }

    /// Whether another pickup would stay within `max_attempts`.
    pub fn has_attempts_left(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }

    /// Start a new attempt: `queued -> processing`, `attempts += 1`.
    ///
    /// A `processing` record is only taken over when it is stale; a fresh one
    /// means another worker holds it.
    pub fn mark_processing(
        &mut self,
        now: DateTime<Utc>,
        max_attempts: u32,
        stale_after: Duration,
    ) -> DomainResult<()> {
        match self.status {
            JobStatus::Queued => {}
            JobStatus::Processing if self.is_stale(now, stale_after) => {}
            from => return Err(DomainError::invalid_transition(self.id, from, "pick up")),
        }
        if !self.has_attempts_left(max_attempts) {
            return Err(DomainError::invalid_transition(
                self.id,
                self.status,
                "pick up past the attempt limit",
            ));
        }

        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> completed` with the collaborator's output.
    pub fn mark_completed(&mut self, result: String, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_processing("complete")?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error_message = None;
        self.finish(now);
        Ok(())
    }

    /// `processing -> failed`, recording why.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_processing("fail")?;
        self.status = JobStatus::Failed;
        self.error_message = Some(error);
        self.result = None;
        self.finish(now);
        Ok(())
    }

    /// `processing -> queued` after a retryable failure.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.require_processing("requeue")?;
        self.status = JobStatus::Queued;
        self.updated_at = now;
        Ok(())
    }

    /// Caller-facing status projection.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            task_id: self.id,
            status: self.status,
            result: self.result.clone().filter(|_| self.status == JobStatus::Completed),
            error: self
                .error_message
                .clone()
                .filter(|_| self.status == JobStatus::Failed),
        }
    }

    fn require_processing(&self, action: &'static str) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invalid_transition(self.id, self.status, action));
        }
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.completed_at = Some(now);
        self.duration_seconds = self.started_at.map(|started| {
            let secs = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
            (secs * 100.0).round() / 100.0
        });
    }
}

/// `{status, result?, error?}` as returned by `GetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub task_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 3;

    fn stale() -> Duration {
        Duration::minutes(15)
    }

    fn job() -> JobRecord {
        JobRecord::new(Some("test"), "f1").unwrap()
    }

    #[test]
    fn new_job_is_queued_with_no_attempts() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.result.is_none() && job.error_message.is_none());
    }

    #[test]
    fn blank_query_falls_back_to_default() {
        let job = JobRecord::new(Some("   "), "f1").unwrap();
        assert_eq!(job.query, DEFAULT_QUERY);

        let job = JobRecord::new(None, "f1").unwrap();
        assert_eq!(job.query, DEFAULT_QUERY);

        let job = JobRecord::new(Some("  revenue trend? "), "f1").unwrap();
        assert_eq!(job.query, "revenue trend?");
    }

    #[test]
    fn empty_file_ref_is_rejected() {
        assert!(matches!(
            JobRecord::new(Some("q"), " "),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn happy_path_sets_result_and_duration() {
        let mut job = job();
        let t0 = Utc::now();
        job.mark_processing(t0, MAX, stale()).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        job.mark_completed("report".into(), t0 + Duration::milliseconds(1500))
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_deref(), Some("report"));
        assert_eq!(job.duration_seconds, Some(1.5));
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());
    }

    #[test]
    fn requeue_returns_to_queued_and_keeps_attempts() {
        let mut job = job();
        let now = Utc::now();
        job.mark_processing(now, MAX, stale()).unwrap();
        job.requeue(now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);

        job.mark_processing(now, MAX, stale()).unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let now = Utc::now();
        let mut done = job();
        done.mark_processing(now, MAX, stale()).unwrap();
        done.mark_completed("ok".into(), now).unwrap();

        let mut failed = job();
        failed.mark_processing(now, MAX, stale()).unwrap();
        failed.mark_failed("boom".into(), now).unwrap();

        for mut j in [done, failed] {
            let before = j.clone();
            assert!(j.mark_processing(now, MAX, stale()).is_err());
            assert!(j.mark_completed("x".into(), now).is_err());
            assert!(j.mark_failed("x".into(), now).is_err());
            assert!(j.requeue(now).is_err());
            assert_eq!(j, before);
        }
    }

    #[test]
    fn fresh_processing_record_cannot_be_picked_up_again() {
        let mut job = job();
        let now = Utc::now();
        job.mark_processing(now, MAX, stale()).unwrap();

        let err = job.mark_processing(now, MAX, stale()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidTransition {
                from: JobStatus::Processing,
                ..
            }
        ));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn stale_processing_record_can_be_reclaimed() {
        let mut job = job();
        let then = Utc::now() - Duration::hours(1);
        job.mark_processing(then, MAX, stale()).unwrap();

        job.mark_processing(Utc::now(), MAX, stale()).unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn pickup_refuses_to_exceed_attempt_limit() {
        let mut job = job();
        let now = Utc::now();
        for _ in 0..MAX {
            job.mark_processing(now, MAX, stale()).unwrap();
            job.requeue(now).unwrap();
        }
        assert!(job.mark_processing(now, MAX, stale()).is_err());
        assert_eq!(job.attempts, MAX);
    }

    #[test]
    fn status_view_exposes_result_only_when_completed() {
        let mut job = job();
        let now = Utc::now();
        assert!(job.status_view().result.is_none());

        job.mark_processing(now, MAX, stale()).unwrap();
        job.mark_completed("answer".into(), now).unwrap();
        let view = job.status_view();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result.as_deref(), Some("answer"));
        assert!(view.error.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "completed");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in JobStatus::ALL {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Action {
            Pickup,
            Succeed,
            Fail,
        }

        fn action() -> impl Strategy<Value = Action> {
            prop_oneof![Just(Action::Pickup), Just(Action::Succeed), Just(Action::Fail)]
        }

        /// Mirrors the lifecycle manager: a failure requeues while attempts
        /// remain and fails the job otherwise.
        fn apply(job: &mut JobRecord, action: &Action, max: u32) {
            let now = Utc::now();
            let _ = match action {
                Action::Pickup => job.mark_processing(now, max, Duration::hours(1)),
                Action::Succeed => job.mark_completed("ok".into(), now),
                Action::Fail if job.has_attempts_left(max) => job.requeue(now),
                Action::Fail => job.mark_failed("boom".into(), now),
            };
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: attempts never exceed the ceiling, and result/error
            /// are exclusive and only present in the matching terminal state.
            #[test]
            fn invariants_hold_for_any_action_sequence(
                actions in proptest::collection::vec(action(), 0..40),
                max in 1u32..6,
            ) {
                let mut job = JobRecord::new(Some("q"), "f").unwrap();
                for a in &actions {
                    apply(&mut job, a, max);

                    prop_assert!(job.attempts <= max);
                    prop_assert!(!(job.result.is_some() && job.error_message.is_some()));
                    prop_assert_eq!(job.result.is_some(), job.status == JobStatus::Completed);
                    prop_assert_eq!(job.error_message.is_some(), job.status == JobStatus::Failed);
                }
            }

            /// Property: once terminal, no action changes the record.
            #[test]
            fn terminal_state_is_absorbing(
                actions in proptest::collection::vec(action(), 0..40),
            ) {
                let mut job = JobRecord::new(Some("q"), "f").unwrap();
                let mut frozen: Option<JobRecord> = None;
                for a in &actions {
                    apply(&mut job, a, 3);
                    match &frozen {
                        Some(snapshot) => prop_assert_eq!(&job, snapshot),
                        None if job.is_terminal() => frozen = Some(job.clone()),
                        None => {}
                    }
                }
            }
        }
    }
}
