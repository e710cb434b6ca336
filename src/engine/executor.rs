//! Deterministic replay step executor.
//!
//! Presents user workflow code a small API (`run`, `sleep`) whose outputs are durably
//! memoized: on any replay of the same run, the same step sequence must produce the same
//! results, or the executor raises [`ExecutorSignal::NonDeterministic`]. The executor holds
//! an in-memory read-model of one run's step-attempt history for the duration of a single
//! processing pass and never caches across passes — the [`super::processor::RunProcessor`]
//! rebuilds it fresh on every claim.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::persistence::{
    CreateStepAttemptParams, JsonError, Store, StepAttempt, StepKind, StepStatus, Timestamp,
};

/// Minimal configuration for one step call. At minimum a non-empty `name`; application code
/// normally constructs this via `impl Into<StepConfig> for &str`.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub name: String,
}

impl From<&str> for StepConfig {
    fn from(name: &str) -> Self {
        StepConfig { name: name.to_string() }
    }
}

impl From<String> for StepConfig {
    fn from(name: String) -> Self {
        StepConfig { name }
    }
}

/// The non-error, non-value control outcome of a step call: either a determinism violation
/// or a durable sleep request. Neither is a "real" workflow error in the user-visible sense —
/// see `§7` of the error handling design — but both interrupt the user function via `?`, so
/// they are modeled as the `Err` arm of every step call's `Result`.
#[derive(Debug, Clone)]
pub enum ExecutorSignal {
    /// The step the workflow is about to perform does not match what replay recorded.
    /// Diagnostically distinguished from an ordinary step failure so operators can tell a
    /// determinism bug from a transient error, even though both flow through the same retry
    /// path.
    NonDeterministic(String),
    /// The workflow must durably suspend until `resumeAt`. MUST NOT be serialized into the
    /// run's `error` column — the processor intercepts it before any error persistence.
    Sleep(Timestamp),
    /// The step body itself returned an error; already persisted as a `failed` step attempt.
    StepFailed(JsonError),
}

impl ExecutorSignal {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutorSignal::NonDeterministic(_) => "NonDeterministicError",
            ExecutorSignal::Sleep(_) => "SleepSignal",
            ExecutorSignal::StepFailed(_) => "StepFailed",
        }
    }

    /// Renders this signal as the run's terminal `error` JSON. Panics if called on `Sleep`,
    /// which must never reach the error column (callers branch on the signal before this).
    pub fn into_json_error(self) -> JsonError {
        match self {
            ExecutorSignal::NonDeterministic(message) => {
                JsonError::named("NonDeterministicError", message)
            }
            ExecutorSignal::StepFailed(error) => error,
            ExecutorSignal::Sleep(_) => {
                unreachable!("SleepSignal must not be serialized into the error column")
            }
        }
    }
}

impl std::fmt::Display for ExecutorSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorSignal::NonDeterministic(message) => write!(f, "{message}"),
            ExecutorSignal::Sleep(resume_at) => write!(f, "sleep until {resume_at}"),
            ExecutorSignal::StepFailed(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ExecutorSignal {}

struct State {
    /// Completed step attempts in canonical (`createdAt`, `id`) order — the only attempts
    /// that participate in replay matching.
    history: Vec<StepAttempt>,
    /// Position in `history` the next `run`/`sleep` call must match.
    expected_index: usize,
}

/// Per-run, in-process replay engine. Constructed fresh by the [`super::processor::RunProcessor`]
/// for every claim; never shared across runs or processing passes.
pub struct StepExecutor {
    store: Arc<dyn Store>,
    namespace_id: String,
    run_id: String,
    worker_id: String,
    state: Mutex<State>,
}

impl StepExecutor {
    /// `attempts` is the run's full step-attempt history, already mutated by the processor to
    /// resolve any due sleeps (see `RunProcessor::resolve_pending_sleeps`).
    pub fn new(
        store: Arc<dyn Store>,
        namespace_id: impl Into<String>,
        run_id: impl Into<String>,
        worker_id: impl Into<String>,
        attempts: Vec<StepAttempt>,
    ) -> Self {
        let mut history: Vec<StepAttempt> = attempts
            .into_iter()
            .filter(|a| a.status == StepStatus::Completed)
            .collect();
        history.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        Self {
            store,
            namespace_id: namespace_id.into(),
            run_id: run_id.into(),
            worker_id: worker_id.into(),
            state: Mutex::new(State {
                history,
                expected_index: 0,
            }),
        }
    }

    /// Looks at the next expected position in history. Returns `Some(attempt)` if it matches
    /// `step_name` (and advances past it), `Err` on a determinism mismatch, or `None` if the
    /// call is past the end of recorded history (meaning: invoke for real).
    async fn match_expected(
        &self,
        step_name: &str,
    ) -> Result<Option<StepAttempt>, ExecutorSignal> {
        let mut state = self.state.lock().await;
        if state.expected_index >= state.history.len() {
            return Ok(None);
        }
        let candidate = state.history[state.expected_index].clone();
        if candidate.step_name != step_name {
            return Err(ExecutorSignal::NonDeterministic(format!(
                "Step order mismatch: expected step \"{}\" but got \"{}\"",
                candidate.step_name, step_name
            )));
        }
        state.expected_index += 1;
        Ok(Some(candidate))
    }

    /// `run(config, fn)`: returns the memoized output if this step was already completed on
    /// a prior pass, otherwise invokes `fn` and durably records the outcome.
    #[instrument(skip(self, f, config), fields(run_id = %self.run_id))]
    pub async fn run<T, F, Fut>(&self, config: impl Into<StepConfig>, f: F) -> Result<T, ExecutorSignal>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let config = config.into();

        if let Some(recorded) = self.match_expected(&config.name).await? {
            debug!("replaying memoized step output");
            let output = recorded.output.unwrap_or(serde_json::Value::Null);
            return Ok(serde_json::from_value(output).map_err(|e| {
                ExecutorSignal::StepFailed(JsonError::new(format!(
                    "failed to deserialize memoized output for step \"{}\": {e}",
                    config.name
                )))
            })?);
        }

        let attempt = self
            .store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: self.namespace_id.clone(),
                workflow_run_id: self.run_id.clone(),
                step_name: config.name.clone(),
                kind: StepKind::Function,
                config: serde_json::Value::Null,
                context: None,
            })
            .await
            .map_err(|e| ExecutorSignal::StepFailed(JsonError::new(e.to_string())))?;

        match f().await {
            Ok(value) => {
                let output = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                self.store
                    .complete_step_attempt(
                        &self.namespace_id,
                        &attempt.id,
                        &self.worker_id,
                        Some(output),
                    )
                    .await
                    .map_err(|e| ExecutorSignal::StepFailed(JsonError::new(e.to_string())))?;
                Ok(value)
            }
            Err(err) => {
                let json_error = JsonError::new(err.to_string());
                self.store
                    .fail_step_attempt(
                        &self.namespace_id,
                        &attempt.id,
                        &self.worker_id,
                        json_error.clone(),
                    )
                    .await
                    .map_err(|e| ExecutorSignal::StepFailed(JsonError::new(e.to_string())))?;
                Err(ExecutorSignal::StepFailed(json_error))
            }
        }
    }

    /// `sleep(name, duration)`: durably suspends the run until `now + duration`, replaying as
    /// a no-op once the sleep has completed on a prior pass.
    #[instrument(skip(self), fields(run_id = %self.run_id, step = %name))]
    pub async fn sleep(&self, name: impl Into<String> + std::fmt::Display, duration: Duration) -> Result<(), ExecutorSignal> {
        let name_str = name.to_string();

        if self.match_expected(&name_str).await?.is_some() {
            debug!("sleep already resolved on a prior pass");
            return Ok(());
        }

        let resume_at = chrono::Utc::now()
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let context = serde_json::json!({ "kind": "sleep", "resumeAt": resume_at });

        self.store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: self.namespace_id.clone(),
                workflow_run_id: self.run_id.clone(),
                step_name: name_str,
                kind: StepKind::Sleep,
                config: serde_json::Value::Null,
                context: Some(context),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to persist sleep step attempt");
                ExecutorSignal::StepFailed(JsonError::new(e.to_string()))
            })?;

        Err(ExecutorSignal::Sleep(resume_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CreateWorkflowRunParams, InMemoryStore, PageOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(store: Arc<dyn Store>, run_id: &str, history: Vec<StepAttempt>) -> StepExecutor {
        StepExecutor::new(store, "ns", run_id, "worker-1", history)
    }

    #[tokio::test]
    async fn replay_returns_memoized_output_without_reinvoking() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "wf".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: None,
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let attempt = store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: "ns".into(),
                workflow_run_id: run.id.clone(),
                step_name: "double".into(),
                kind: StepKind::Function,
                config: serde_json::Value::Null,
                context: None,
            })
            .await
            .unwrap();
        store
            .complete_step_attempt("ns", &attempt.id, "worker-0", Some(serde_json::json!(42)))
            .await
            .unwrap();

        let history = store
            .list_step_attempts("ns", &run.id, PageOptions::default())
            .await
            .unwrap()
            .data;

        let exec = executor(store.clone(), &run.id, history);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let output: i64 = exec
            .run("double", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(999)
            })
            .await
            .unwrap();

        assert_eq!(output, 42, "replay must return the recorded output, not re-invoke the closure");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_deterministic_step_name_raises_signal() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "wf".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: None,
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let attempt = store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: "ns".into(),
                workflow_run_id: run.id.clone(),
                step_name: "first".into(),
                kind: StepKind::Function,
                config: serde_json::Value::Null,
                context: None,
            })
            .await
            .unwrap();
        store
            .complete_step_attempt("ns", &attempt.id, "worker-0", Some(serde_json::json!(1)))
            .await
            .unwrap();

        let history = store
            .list_step_attempts("ns", &run.id, PageOptions::default())
            .await
            .unwrap()
            .data;

        let exec = executor(store, &run.id, history);
        let err = exec
            .run("second", || async { Ok::<i32, anyhow::Error>(1) })
            .await
            .unwrap_err();

        match err {
            ExecutorSignal::NonDeterministic(message) => {
                assert_eq!(
                    message,
                    "Step order mismatch: expected step \"first\" but got \"second\""
                );
            }
            other => panic!("expected NonDeterministic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sleep_already_resolved_on_prior_pass_returns_immediately() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "wf".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: None,
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let attempt = store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: "ns".into(),
                workflow_run_id: run.id.clone(),
                step_name: "nap".into(),
                kind: StepKind::Sleep,
                config: serde_json::Value::Null,
                context: Some(serde_json::json!({"kind": "sleep", "resumeAt": chrono::Utc::now()})),
            })
            .await
            .unwrap();
        store
            .complete_step_attempt("ns", &attempt.id, "worker-0", None)
            .await
            .unwrap();

        let history = store
            .list_step_attempts("ns", &run.id, PageOptions::default())
            .await
            .unwrap()
            .data;

        let exec = executor(store, &run.id, history);
        exec.sleep("nap", Duration::from_secs(60))
            .await
            .expect("already-resolved sleep must not raise the Sleep signal again");
    }

    #[tokio::test]
    async fn sleep_not_yet_recorded_persists_and_raises_sleep_signal() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "wf".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: None,
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let exec = executor(store.clone(), &run.id, Vec::new());
        let err = exec.sleep("nap", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ExecutorSignal::Sleep(_)));

        let recorded = store
            .list_step_attempts("ns", &run.id, PageOptions::default())
            .await
            .unwrap()
            .data;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, StepKind::Sleep);
        assert_eq!(recorded[0].status, StepStatus::Running);
    }
}
