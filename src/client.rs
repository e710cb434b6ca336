//! The library's external-facing surface: define a workflow, submit a run, wait for its
//! result. Everything here is a thin typed wrapper over [`Store`] and the engine's type-erased
//! [`RegisteredWorkflow`] — the executor and worker never see `I`/`O` directly.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::engine::{ExecutorSignal, RegisteredWorkflow, StepExecutor};
use crate::persistence::{
    CreateWorkflowRunParams, JsonError, RunStatus, Store, StoreError, Timestamp, WorkflowRun,
};
use crate::reliability::RetryPolicy;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// How often [`Handle::result`] polls the Store while a run is non-terminal.
const DEFAULT_RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A workflow function body, typed at the boundary: input/output cross the wire as `I`/`O`,
/// everything `step.run`/`step.sleep` touches in between stays native Rust.
pub type WorkflowFn<I, O> =
    Arc<dyn Fn(I, Arc<StepExecutor>) -> BoxFuture<Result<O, anyhow::Error>> + Send + Sync>;

/// `defineWorkflow`'s result: a named, typed function plus its retry policy, not yet bound to
/// a Store or namespace.
pub struct WorkflowDefinition<I, O> {
    name: String,
    version: Option<String>,
    retry_policy: RetryPolicy,
    func: WorkflowFn<I, O>,
}

impl<I, O> Clone for WorkflowDefinition<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            retry_policy: self.retry_policy.clone(),
            func: self.func.clone(),
        }
    }
}

impl<I, O> WorkflowDefinition<I, O>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: WorkflowFn<I, O>) -> Self {
        Self {
            name: name.into(),
            version: None,
            retry_policy: RetryPolicy::default(),
            func,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Erases `I`/`O` into the JSON-in, JSON-out shape the worker's registry and run processor
    /// operate on.
    pub fn registered(&self) -> RegisteredWorkflow {
        let func = self.func.clone();
        RegisteredWorkflow {
            name: self.name.clone(),
            version: self.version.clone(),
            retry_policy: self.retry_policy.clone(),
            func: Arc::new(move |input_json, executor, _version| {
                let func = func.clone();
                Box::pin(async move {
                    let input: I = serde_json::from_value(input_json).map_err(|e| {
                        ExecutorSignal::StepFailed(JsonError::new(format!(
                            "failed to deserialize workflow input: {e}"
                        )))
                    })?;
                    let output = func(input, executor)
                        .await
                        .map_err(|e| ExecutorSignal::StepFailed(JsonError::new(e.to_string())))?;
                    serde_json::to_value(output).map_err(|e| {
                        ExecutorSignal::StepFailed(JsonError::new(format!(
                            "failed to serialize workflow output: {e}"
                        )))
                    })
                })
            }),
        }
    }
}

/// Options accepted by [`Workflow::run`], mirroring `createWorkflowRun`'s optional fields.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<i32>,
    pub available_at: Option<Timestamp>,
    pub deadline_at: Option<Timestamp>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_concurrency(mut self, key: impl Into<String>, limit: i32) -> Self {
        self.concurrency_key = Some(key.into());
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_available_at(mut self, available_at: Timestamp) -> Self {
        self.available_at = Some(available_at);
        self
    }

    pub fn with_deadline_at(mut self, deadline_at: Timestamp) -> Self {
        self.deadline_at = Some(deadline_at);
        self
    }
}

/// A workflow bound to a Store and namespace, ready to accept runs.
pub struct Workflow<I, O> {
    store: Arc<dyn Store>,
    namespace_id: String,
    definition: WorkflowDefinition<I, O>,
}

impl<I, O> Workflow<I, O>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        store: Arc<dyn Store>,
        namespace_id: impl Into<String>,
        definition: WorkflowDefinition<I, O>,
    ) -> Self {
        Self {
            store,
            namespace_id: namespace_id.into(),
            definition,
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// The type-erased registration a [`crate::worker::Worker`]'s registry expects.
    pub fn registered(&self) -> RegisteredWorkflow {
        self.definition.registered()
    }

    #[instrument(skip(self, input), fields(workflow_name = %self.definition.name))]
    pub async fn run(&self, input: I, options: RunOptions) -> Result<Handle<O>, StoreError> {
        let input_json = serde_json::to_value(&input).map_err(|e| {
            StoreError::Internal(format!("failed to serialize workflow input: {e}"))
        })?;

        let run = self
            .store
            .create_workflow_run(CreateWorkflowRunParams {
                namespace_id: self.namespace_id.clone(),
                workflow_name: self.definition.name.clone(),
                version: self.definition.version.clone(),
                idempotency_key: options.idempotency_key,
                concurrency_key: options.concurrency_key,
                concurrency_limit: options.concurrency_limit,
                config: serde_json::Value::Null,
                context: None,
                input: Some(input_json),
                available_at: options.available_at,
                deadline_at: options.deadline_at,
            })
            .await?;

        Ok(Handle::new(self.store.clone(), self.namespace_id.clone(), run))
    }
}

/// Errors surfaced by [`Handle::result`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Workflow run {0} was canceled")]
    Canceled(String),

    #[error("{0}")]
    Failed(JsonError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to deserialize workflow output: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// A handle to one submitted run. `result()` polls until the run reaches a terminal state;
/// `cancel()` requests cancellation.
pub struct Handle<O> {
    store: Arc<dyn Store>,
    namespace_id: String,
    pub workflow_run: WorkflowRun,
    poll_interval: Duration,
    _output: PhantomData<fn() -> O>,
}

impl<O> Handle<O>
where
    O: DeserializeOwned,
{
    fn new(store: Arc<dyn Store>, namespace_id: String, workflow_run: WorkflowRun) -> Self {
        Self {
            store,
            namespace_id,
            workflow_run,
            poll_interval: DEFAULT_RESULT_POLL_INTERVAL,
            _output: PhantomData,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Polls `getWorkflowRun` until the run reaches a terminal state, then resolves to its
    /// output, the stored error, or a cancellation message.
    #[instrument(skip(self), fields(run_id = %self.workflow_run.id))]
    pub async fn result(&self) -> Result<O, ClientError> {
        let mut run = self.workflow_run.clone();
        loop {
            match run.status {
                RunStatus::Completed => {
                    let output = run.output.unwrap_or(serde_json::Value::Null);
                    return Ok(serde_json::from_value(output)?);
                }
                RunStatus::Failed => {
                    let error = run
                        .error
                        .unwrap_or_else(|| JsonError::new("workflow run failed with no error recorded"));
                    return Err(ClientError::Failed(error));
                }
                RunStatus::Canceled => {
                    return Err(ClientError::Canceled(run.id));
                }
                _ => {
                    tokio::time::sleep(self.poll_interval).await;
                    run = self.store.get_workflow_run(&self.namespace_id, &run.id).await?;
                }
            }
        }
    }

    #[instrument(skip(self), fields(run_id = %self.workflow_run.id))]
    pub async fn cancel(&self) -> Result<WorkflowRun, StoreError> {
        self.store
            .cancel_workflow_run(&self.namespace_id, &self.workflow_run.id)
            .await
    }
}
