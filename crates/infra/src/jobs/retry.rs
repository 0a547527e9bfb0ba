//! Retry policy and the controller that runs one analysis attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use docket_analysis::{AnalysisError, AnalysisRequest, Analyzer};
use docket_core::JobRecord;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Deadline for a single collaborator call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            attempt_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total attempts a job may make (the first one plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate delay before retrying after `attempt` failed (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a job that has made `attempts` attempts may try again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts()
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded(String),
    Failed(AnalysisError),
}

impl From<Result<String, AnalysisError>> for AttemptOutcome {
    fn from(result: Result<String, AnalysisError>) -> Self {
        match result {
            Ok(output) => AttemptOutcome::Succeeded(output),
            Err(err) => AttemptOutcome::Failed(err),
        }
    }
}

/// Runs one attempt of a picked-up job. The worker pool only knows this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &JobRecord) -> AttemptOutcome;
}

#[async_trait]
impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    async fn execute(&self, job: &JobRecord) -> AttemptOutcome {
        (**self).execute(job).await
    }
}

/// Wraps the analysis collaborator with the per-attempt deadline.
///
/// The call runs on its own task. When the deadline passes the attempt is
/// reported as failed and the task is left to finish on its own; the
/// collaborator is never interrupted mid-call.
#[derive(Debug)]
pub struct RetryController<A> {
    analyzer: Arc<A>,
    policy: RetryPolicy,
}

impl<A: Analyzer> RetryController<A> {
    pub fn new(analyzer: A, policy: RetryPolicy) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<A: Analyzer> Executor for RetryController<A> {
    async fn execute(&self, job: &JobRecord) -> AttemptOutcome {
        let request = AnalysisRequest::from(job);
        let analyzer = self.analyzer.clone();
        let call = tokio::spawn(async move { analyzer.analyze(&request).await });

        let timeout = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => {
                debug!(job_id = %job.id, attempt = job.attempts, ok = result.is_ok(), "attempt finished");
                result.into()
            }
            Ok(Err(join_err)) => {
                warn!(job_id = %job.id, attempt = job.attempts, error = %join_err, "analysis task aborted");
                AttemptOutcome::Failed(AnalysisError::failed(format!(
                    "analysis task aborted: {join_err}"
                )))
            }
            Err(_) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    timeout_secs = timeout.as_secs_f64(),
                    "attempt timed out; abandoning collaborator call"
                );
                AttemptOutcome::Failed(AnalysisError::Timeout(timeout))
            }
        }
    }
}
