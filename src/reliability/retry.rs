//! Retry policy: a pure function deciding, on workflow-run failure, whether the run is
//! rescheduled or terminated.
//!
//! `RetryPolicy` itself is plain data; all of the decision logic lives in
//! [`compute_failed_workflow_run_update`], which the Store's `failWorkflowRun` delegates to.
//! Keeping the function pure (no I/O, no clock access beyond the `now` parameter) is what
//! makes the run state machine's retry behavior exhaustively unit-testable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::{JsonError, RunStatus, Timestamp};

/// Configuration for a workflow's retry behavior.
///
/// # Example
///
/// ```
/// use everruns_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first) before the run is terminal.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Ceiling on the backoff delay, regardless of attempt count.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied per attempt (e.g. `2.0` for doubling).
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// `initialInterval = 1s, maximumInterval` large, `backoffCoefficient = 2`,
    /// `maximumAttempts = 3` — the engine's documented defaults.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(24 * 60 * 60),
            backoff_coefficient: 2.0,
        }
    }

    /// A policy that never retries: the first failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
        }
    }

    /// A policy with fixed intervals (no exponential growth).
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// `delay = min(initialInterval × backoffCoefficient^(attempts−1), maximumInterval)`.
    ///
    /// `attempts` is 1-based: the count of attempts already made (the `WorkflowRun.attempts`
    /// column, incremented on every successful claim).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let retry_num = attempts.max(1) - 1;
        let base =
            self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(retry_num as i32);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Result of [`compute_failed_workflow_run_update`]: the fields `failWorkflowRun` applies.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRunUpdate {
    pub status: RunStatus,
    pub available_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub error: JsonError,
}

/// `computeFailedWorkflowRunUpdate(policy, attempts, deadlineAt, error, now) → update`.
///
/// Pure: given the policy, the run's current attempt count, its optional deadline, the error
/// that failed it, and the current time, decides whether the run should be rescheduled
/// (`pending`, with a backoff `available_at`) or is now terminal (`failed`).
pub fn compute_failed_workflow_run_update(
    policy: &RetryPolicy,
    attempts: u32,
    deadline_at: Option<Timestamp>,
    error: JsonError,
    now: Timestamp,
) -> FailedRunUpdate {
    let delay = policy.delay_for_attempt(attempts);
    let next_available_at = now
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

    let exhausted = attempts >= policy.max_attempts;
    let past_deadline = deadline_at.is_some_and(|d| next_available_at > d);

    if exhausted || past_deadline {
        FailedRunUpdate {
            status: RunStatus::Failed,
            available_at: None,
            finished_at: Some(now),
            error,
        }
    } else {
        FailedRunUpdate {
            status: RunStatus::Pending,
            available_at: Some(next_available_at),
            finished_at: None,
            error,
        }
    }
}

/// Serde support for `Duration` as milliseconds — the crate-wide convention for durations
/// carried over the wire or stored in JSON config columns.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
