//! Run processor: orchestrates a single claimed run from history to terminal outcome.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::engine::registry::RegisteredWorkflow;
use crate::engine::{ExecutorSignal, StepExecutor};
use crate::persistence::{
    JsonError, PageOptions, SleepContext, Store, StoreError, StepKind, StepStatus, WorkflowRun,
};
use crate::reliability::{compute_failed_workflow_run_update, RetryPolicy};

const HISTORY_PAGE_SIZE: i64 = 1000;

/// Errors the processor itself raises, distinct from the `Store`/`Executor` errors it
/// otherwise just forwards into `failWorkflowRun`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Orchestrates one claimed [`WorkflowRun`]: loads its full step-attempt history, resolves
/// any due sleep, invokes the registered user function through a fresh [`StepExecutor`], and
/// persists the terminal (or rescheduled) outcome.
pub struct RunProcessor {
    store: Arc<dyn Store>,
}

impl RunProcessor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Drives `run` to completion for this claim. Never returns an error for ordinary
    /// workflow-level failures — those are folded into the run's persisted terminal state;
    /// only infrastructure errors (the Store being unreachable mid-pass) surface here.
    #[instrument(skip(self, run, workflow), fields(run_id = %run.id, workflow_name = %run.workflow_name))]
    pub async fn process(
        &self,
        run: WorkflowRun,
        workflow: &RegisteredWorkflow,
    ) -> Result<(), ProcessorError> {
        let worker_id = match &run.worker_id {
            Some(id) => id.clone(),
            None => {
                warn!("processor invoked on a run with no lease owner, skipping");
                return Ok(());
            }
        };

        let mut history = self.load_full_history(&run).await?;

        if let Some(signal) = self
            .resolve_pending_sleeps(&run, &worker_id, &mut history)
            .await?
        {
            return self.apply_sleep(&run, &worker_id, signal).await;
        }

        let executor = Arc::new(StepExecutor::new(
            self.store.clone(),
            run.namespace_id.clone(),
            run.id.clone(),
            worker_id.clone(),
            history,
        ));

        let input = run.input.clone().unwrap_or(serde_json::Value::Null);
        let version = run.version.clone();
        let outcome = (workflow.func)(input, executor, version).await;

        match outcome {
            Ok(output) => self.complete(&run, &worker_id, output).await,
            Err(ExecutorSignal::Sleep(resume_at)) => {
                self.apply_sleep(&run, &worker_id, resume_at).await
            }
            Err(signal) => {
                self.fail(&run, &worker_id, signal.into_json_error(), &workflow.retry_policy)
                    .await
            }
        }
    }

    async fn load_full_history(
        &self,
        run: &WorkflowRun,
    ) -> Result<Vec<crate::persistence::StepAttempt>, ProcessorError> {
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .store
                .list_step_attempts(
                    &run.namespace_id,
                    &run.id,
                    PageOptions {
                        after: after.clone(),
                        before: None,
                        limit: Some(HISTORY_PAGE_SIZE),
                    },
                )
                .await?;
            let has_more = page.next.is_some();
            all.extend(page.data);
            if !has_more {
                break;
            }
            after = page.next;
        }
        Ok(all)
    }

    /// Transitions due `sleep` attempts to `completed` in place. Returns `Some(resume_at)` if
    /// a still-pending sleep is encountered, meaning the user function must not run this pass.
    async fn resolve_pending_sleeps(
        &self,
        run: &WorkflowRun,
        worker_id: &str,
        history: &mut [crate::persistence::StepAttempt],
    ) -> Result<Option<chrono::DateTime<Utc>>, ProcessorError> {
        let now = Utc::now();
        for attempt in history.iter_mut() {
            if attempt.kind != StepKind::Sleep || attempt.status != StepStatus::Running {
                continue;
            }
            let resume_at = attempt
                .context
                .clone()
                .and_then(|c| serde_json::from_value::<SleepContext>(c).ok())
                .map(|c| c.resume_at)
                .unwrap_or(now);

            if now >= resume_at {
                let completed = self
                    .store
                    .complete_step_attempt(&run.namespace_id, &attempt.id, worker_id, None)
                    .await?;
                *attempt = completed;
            } else {
                return Ok(Some(resume_at));
            }
        }
        Ok(None)
    }

    async fn complete(
        &self,
        run: &WorkflowRun,
        worker_id: &str,
        output: serde_json::Value,
    ) -> Result<(), ProcessorError> {
        self.store
            .complete_workflow_run(&run.namespace_id, &run.id, worker_id, Some(output))
            .await?;
        info!("workflow run completed");
        Ok(())
    }

    async fn apply_sleep(
        &self,
        run: &WorkflowRun,
        worker_id: &str,
        resume_at: chrono::DateTime<Utc>,
    ) -> Result<(), ProcessorError> {
        self.store
            .sleep_workflow_run(&run.namespace_id, &run.id, worker_id, resume_at)
            .await?;
        info!(%resume_at, "workflow run suspended");
        Ok(())
    }

    async fn fail(
        &self,
        run: &WorkflowRun,
        worker_id: &str,
        error: JsonError,
        retry_policy: &RetryPolicy,
    ) -> Result<(), ProcessorError> {
        // `failWorkflowRun` itself delegates the retry-vs-terminal decision to
        // `compute_failed_workflow_run_update`; calling it here too would be redundant with
        // what the Store does internally, but logging the *intended* decision is useful for
        // operators watching a single worker.
        let preview = compute_failed_workflow_run_update(
            retry_policy,
            run.attempts as u32,
            run.deadline_at,
            error.clone(),
            Utc::now(),
        );
        warn!(next_status = preview.status.as_str(), error = %error, "workflow run failed");

        self.store
            .fail_workflow_run(crate::persistence::FailWorkflowRunParams {
                namespace_id: run.namespace_id.clone(),
                run_id: run.id.clone(),
                worker_id: worker_id.to_string(),
                error,
                retry_policy,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::WorkflowFn;
    use crate::persistence::{ClaimParams, CreateWorkflowRunParams, InMemoryStore, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn claim_one(store: &Arc<dyn Store>, namespace_id: &str, worker_id: &str) -> WorkflowRun {
        store
            .claim_workflow_run(ClaimParams {
                namespace_id: namespace_id.into(),
                worker_id: worker_id.into(),
                lease_duration_ms: 30_000,
            })
            .await
            .unwrap()
            .expect("a run should be claimable")
    }

    fn echo_func() -> WorkflowFn {
        std::sync::Arc::new(move |input, _executor, _version| {
            Box::pin(async move { Ok(input) })
        })
    }

    /// Fails the run on its first invocation (after completing one step), succeeds on the
    /// second. Lets a test assert the step ran once across both passes.
    fn fails_once_then_succeeds(
        step_calls: Arc<AtomicUsize>,
        invocation: Arc<AtomicUsize>,
    ) -> WorkflowFn {
        std::sync::Arc::new(move |_input, executor, _version| {
            let step_calls = step_calls.clone();
            let invocation = invocation.clone();
            Box::pin(async move {
                let value: i64 = executor
                    .run("add-one", || {
                        let step_calls = step_calls.clone();
                        async move {
                            step_calls.fetch_add(1, Ordering::SeqCst);
                            Ok(1)
                        }
                    })
                    .await?;

                if invocation.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ExecutorSignal::StepFailed(JsonError::new("transient")));
                }
                Ok(serde_json::json!(value))
            })
        })
    }

    fn registered(func: WorkflowFn, retry_policy: RetryPolicy) -> RegisteredWorkflow {
        RegisteredWorkflow {
            name: "test_workflow".into(),
            version: None,
            retry_policy,
            func,
        }
    }

    #[tokio::test]
    async fn process_completes_run_and_memoizes_step_on_a_second_pass() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let created = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "test_workflow".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: Some(serde_json::json!({})),
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let step_calls = Arc::new(AtomicUsize::new(0));
        let invocation = Arc::new(AtomicUsize::new(0));
        let retry_policy = RetryPolicy::fixed(std::time::Duration::ZERO, 3);
        let workflow = registered(
            fails_once_then_succeeds(step_calls.clone(), invocation.clone()),
            retry_policy,
        );
        let processor = RunProcessor::new(store.clone());

        let first_pass = claim_one(&store, "ns", "worker-1").await;
        processor.process(first_pass, &workflow).await.unwrap();

        let after_first = store.get_workflow_run("ns", &created.id).await.unwrap();
        assert_eq!(after_first.status, RunStatus::Pending, "first pass should reschedule");
        assert_eq!(step_calls.load(Ordering::SeqCst), 1);

        let second_pass = claim_one(&store, "ns", "worker-2").await;
        assert_eq!(second_pass.id, created.id);
        processor.process(second_pass, &workflow).await.unwrap();

        let after_second = store.get_workflow_run("ns", &created.id).await.unwrap();
        assert_eq!(after_second.status, RunStatus::Completed);
        assert_eq!(after_second.output, Some(serde_json::json!(1)));
        assert_eq!(
            step_calls.load(Ordering::SeqCst),
            1,
            "replay must not re-invoke the already-completed step"
        );
    }

    #[tokio::test]
    async fn process_marks_run_completed_with_echoed_output() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "test_workflow".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: serde_json::Value::Null,
                context: None,
                input: Some(serde_json::json!({"hello": "world"})),
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let workflow = registered(echo_func(), RetryPolicy::exponential());
        let processor = RunProcessor::new(store.clone());

        let run = claim_one(&store, "ns", "worker-1").await;
        let id = run.id.clone();
        processor.process(run, &workflow).await.unwrap();

        let fetched = store.get_workflow_run("ns", &id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(fetched.output, Some(serde_json::json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn resolve_pending_sleeps_returns_resume_at_for_future_sleep() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "test_workflow".into(),
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
        let claimed = claim_one(&store, "ns", "worker-1").await;
        assert_eq!(claimed.id, run.id);

        let resume_at = Utc::now() + chrono::Duration::seconds(3600);
        store
            .create_step_attempt(crate::persistence::CreateStepAttemptParams {
                namespace_id: "ns".into(),
                workflow_run_id: run.id.clone(),
                step_name: "nap".into(),
                kind: StepKind::Sleep,
                config: serde_json::Value::Null,
                context: Some(serde_json::json!({"kind": "sleep", "resumeAt": resume_at})),
            })
            .await
            .unwrap();

        let processor = RunProcessor::new(store.clone());
        let mut history = processor.load_full_history(&claimed).await.unwrap();
        let signal = processor
            .resolve_pending_sleeps(&claimed, "worker-1", &mut history)
            .await
            .unwrap();

        assert_eq!(signal, Some(resume_at));
    }

    #[tokio::test]
    async fn resolve_pending_sleeps_completes_due_sleep_in_place() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "test_workflow".into(),
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
        let claimed = claim_one(&store, "ns", "worker-1").await;

        let resume_at = Utc::now() - chrono::Duration::seconds(1);
        store
            .create_step_attempt(crate::persistence::CreateStepAttemptParams {
                namespace_id: "ns".into(),
                workflow_run_id: run.id.clone(),
                step_name: "nap".into(),
                kind: StepKind::Sleep,
                config: serde_json::Value::Null,
                context: Some(serde_json::json!({"kind": "sleep", "resumeAt": resume_at})),
            })
            .await
            .unwrap();

        let processor = RunProcessor::new(store.clone());
        let mut history = processor.load_full_history(&claimed).await.unwrap();
        let signal = processor
            .resolve_pending_sleeps(&claimed, "worker-1", &mut history)
            .await
            .unwrap();

        assert_eq!(signal, None);
        assert_eq!(history[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn load_full_history_follows_cursor_past_a_single_page() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let run = store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "test_workflow".into(),
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

        // HISTORY_PAGE_SIZE is 1000; create enough attempts to span two pages.
        let step_count = HISTORY_PAGE_SIZE as usize + 10;
        for i in 0..step_count {
            let attempt = store
                .create_step_attempt(crate::persistence::CreateStepAttemptParams {
                    namespace_id: "ns".into(),
                    workflow_run_id: run.id.clone(),
                    step_name: format!("step-{i}"),
                    kind: StepKind::Function,
                    config: serde_json::Value::Null,
                    context: None,
                })
                .await
                .unwrap();
            store
                .complete_step_attempt("ns", &attempt.id, "worker-1", Some(serde_json::json!(i)))
                .await
                .unwrap();
        }

        let processor = RunProcessor::new(store.clone());
        let history = processor.load_full_history(&run).await.unwrap();
        assert_eq!(history.len(), step_count);
    }
}
