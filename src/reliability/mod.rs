//! Reliability: the pure retry-decision function consulted on workflow-run failure.
//!
//! - [`RetryPolicy`] — configurable exponential backoff.
//! - [`compute_failed_workflow_run_update`] — the pure function behind `failWorkflowRun`.

mod retry;

pub use retry::{compute_failed_workflow_run_update, FailedRunUpdate, RetryPolicy};
