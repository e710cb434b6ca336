//! The `Store` trait: durable state and the atomic primitives the engine depends on.
//!
//! Multiple implementations exist ([`PostgresStore`](crate::persistence::PostgresStore) for
//! production, [`InMemoryStore`](crate::persistence::InMemoryStore) for tests). All must
//! satisfy the contracts documented on each method bit-exactly: the executor and worker are
//! written against this trait alone and never assume a particular backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::reliability::RetryPolicy;

/// Millisecond-precision timestamp. All stored timestamps use this precision; callers must
/// not leak sub-millisecond components into cursors or comparisons.
pub type Timestamp = DateTime<Utc>;

/// A JSON error shape: `{name?, message, stack?}`, per the error serialization contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JsonError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Status of a [`WorkflowRun`]. A legacy `succeeded` value may be present in historical rows
/// and is treated as equivalent to `Completed` on read; new writes always use `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running | RunStatus::Sleeping)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Parses the wire representation, mapping the legacy `succeeded` alias to `Completed`.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "sleeping" => Ok(RunStatus::Sleeping),
            "completed" | "succeeded" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(StoreError::Internal(format!("unknown run status: {other}"))),
        }
    }

    /// Wire representation used for new writes. Never emits the legacy `succeeded` alias.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Sleeping => "sleeping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

/// Kind of a [`StepAttempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Function,
    Sleep,
}

impl StepKind {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "function" => Ok(StepKind::Function),
            "sleep" => Ok(StepKind::Sleep),
            other => Err(StoreError::Internal(format!("unknown step kind: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Function => "function",
            StepKind::Sleep => "sleep",
        }
    }
}

/// Status of a [`StepAttempt`]. Legacy `succeeded` reads as `Completed`, mirroring [`RunStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "running" => Ok(StepStatus::Running),
            "completed" | "succeeded" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(StoreError::Internal(format!("unknown step status: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// One execution instance of a named workflow. The Store is the sole owner of this state;
/// the executor only ever holds a read-model snapshot for the duration of one processing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub namespace_id: String,
    pub id: String,
    pub workflow_name: String,
    pub version: Option<String>,
    pub status: RunStatus,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<i32>,
    pub config: Value,
    pub context: Option<Value>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<JsonError>,
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub available_at: Option<Timestamp>,
    pub deadline_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One recorded attempt to execute one named step inside one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub namespace_id: String,
    pub id: String,
    pub workflow_run_id: String,
    pub step_name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub config: Value,
    pub context: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<JsonError>,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Context of a durable sleep step, stored in [`StepAttempt::context`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepContext {
    pub kind: String,
    #[serde(rename = "resumeAt")]
    pub resume_at: Timestamp,
}

/// Opaque forward/backward cursor: base64 of canonical JSON `{"createdAt", "id"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    pub id: String,
}

impl Cursor {
    pub fn new(created_at: Timestamp, id: impl Into<String>) -> Self {
        Self {
            created_at_ms: created_at.timestamp_millis(),
            id: id.into(),
        }
    }

    pub fn encode(&self) -> String {
        use base64::Engine as _;
        let json = serde_json::to_vec(self).expect("cursor serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| StoreError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidCursor(e.to_string()))
    }
}

/// A page of results plus opaque cursors for the adjacent pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub next: Option<String>,
    pub prev: Option<String>,
}

/// Cursor-pagination options shared by `listWorkflowRuns` and `listStepAttempts`.
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    pub after: Option<String>,
    pub before: Option<String>,
    pub limit: Option<i64>,
}

impl PageOptions {
    pub fn limit_or_default(&self, default: i64) -> i64 {
        self.limit.unwrap_or(default).max(1)
    }
}

/// Inputs to `createWorkflowRun`.
#[derive(Debug, Clone)]
pub struct CreateWorkflowRunParams {
    pub namespace_id: String,
    pub workflow_name: String,
    pub version: Option<String>,
    pub idempotency_key: Option<String>,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<i32>,
    pub config: Value,
    pub context: Option<Value>,
    pub input: Option<Value>,
    pub available_at: Option<Timestamp>,
    pub deadline_at: Option<Timestamp>,
}

/// Filters for `listWorkflowRuns`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
}

/// Inputs to `claimWorkflowRun`.
#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub namespace_id: String,
    pub worker_id: String,
    pub lease_duration_ms: i64,
}

/// Inputs to `failWorkflowRun`.
#[derive(Debug, Clone)]
pub struct FailWorkflowRunParams<'a> {
    pub namespace_id: String,
    pub run_id: String,
    pub worker_id: String,
    pub error: JsonError,
    pub retry_policy: &'a RetryPolicy,
}

/// Inputs to `rescheduleWorkflowRunAfterFailedStepAttempt`.
#[derive(Debug, Clone)]
pub struct RescheduleParams {
    pub namespace_id: String,
    pub run_id: String,
    pub worker_id: String,
    pub error: JsonError,
    pub available_at: Timestamp,
}

/// Inputs to `createStepAttempt`.
#[derive(Debug, Clone)]
pub struct CreateStepAttemptParams {
    pub namespace_id: String,
    pub workflow_run_id: String,
    pub step_name: String,
    pub kind: StepKind,
    pub config: Value,
    pub context: Option<Value>,
}

/// Errors surfaced by Store mutations. `Display` renders the exact message fragments the
/// engine's external error vocabulary promises; callers that need to branch on the cause
/// should match the variant rather than parse the message.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Workflow run {0} does not exist")]
    RunNotFound(String),

    #[error("Step attempt {0} does not exist")]
    StepAttemptNotFound(String),

    #[error("Cannot cancel workflow run {0} with status {1}")]
    CannotCancel(String, &'static str),

    #[error(
        "Invalid workflow concurrency metadata: \"concurrencyKey\" and \"concurrencyLimit\" must both be null or both be set."
    )]
    InvalidConcurrencyMetadata,

    #[error("Workflow run concurrency limit mismatch for bucket {0}")]
    ConcurrencyLimitMismatch(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Failed to sleep workflow run")]
    FailedToSleep,

    #[error("Failed to mark step attempt completed")]
    FailedToCompleteStepAttempt,

    #[error("Failed to mark step attempt failed")]
    FailedToFailStepAttempt,

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Internal(e.to_string())
    }
}

/// All durable state and the atomic primitives the engine depends on.
///
/// Every implementation must satisfy these contracts bit-exactly; the worker, processor, and
/// executor are written only against this trait.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_workflow_run(
        &self,
        params: CreateWorkflowRunParams,
    ) -> Result<WorkflowRun, StoreError>;

    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<WorkflowRun, StoreError>;

    async fn get_workflow_run_by_idempotency_key(
        &self,
        namespace_id: &str,
        workflow_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError>;

    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        filter: WorkflowRunFilter,
        page: PageOptions,
    ) -> Result<Page<WorkflowRun>, StoreError>;

    /// Atomically sweeps expired deadlines, selects one claimable candidate under the
    /// concurrency predicate, and leases it to `worker_id`. Returns `None` if nothing is
    /// claimable.
    async fn claim_workflow_run(&self, params: ClaimParams)
        -> Result<Option<WorkflowRun>, StoreError>;

    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, StoreError>;

    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        available_at: Timestamp,
    ) -> Result<WorkflowRun, StoreError>;

    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        output: Option<Value>,
    ) -> Result<WorkflowRun, StoreError>;

    async fn fail_workflow_run(
        &self,
        params: FailWorkflowRunParams<'_>,
    ) -> Result<WorkflowRun, StoreError>;

    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        params: RescheduleParams,
    ) -> Result<WorkflowRun, StoreError>;

    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
    ) -> Result<WorkflowRun, StoreError>;

    async fn create_step_attempt(
        &self,
        params: CreateStepAttemptParams,
    ) -> Result<StepAttempt, StoreError>;

    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<StepAttempt, StoreError>;

    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        workflow_run_id: &str,
        page: PageOptions,
    ) -> Result<Page<StepAttempt>, StoreError>;

    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        output: Option<Value>,
    ) -> Result<StepAttempt, StoreError>;

    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        error: JsonError,
    ) -> Result<StepAttempt, StoreError>;
}
