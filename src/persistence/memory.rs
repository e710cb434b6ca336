//! In-memory [`Store`] implementation: single-process, `parking_lot`-guarded, used by the
//! crate's own unit tests and by embedding applications that want the engine's semantics
//! without a database. All three Store steps of `claimWorkflowRun` run under one lock, which
//! is what makes them atomic here; [`PostgresStore`](super::PostgresStore) gets the same
//! atomicity from row locks and `FOR UPDATE SKIP LOCKED` instead.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::reliability::compute_failed_workflow_run_update;

/// Idempotency-key lookback window. See `SPEC_FULL.md`'s open question on this constant: fixed
/// today, expected to become caller-configurable without changing the `createdAt >= now -
/// window` semantics.
const IDEMPOTENCY_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

const DEFAULT_PAGE_LIMIT: i64 = 50;

fn validate_concurrency_metadata(
    key: &Option<String>,
    limit: &Option<i32>,
) -> Result<(), StoreError> {
    match (key, limit) {
        (None, None) => Ok(()),
        (Some(k), Some(l)) => {
            if k.trim().is_empty() || *l <= 0 {
                Err(StoreError::InvalidConcurrencyMetadata)
            } else {
                Ok(())
            }
        }
        _ => Err(StoreError::InvalidConcurrencyMetadata),
    }
}

fn concurrency_bucket(run: &WorkflowRun) -> Option<(String, String, Option<String>, String)> {
    run.concurrency_key.clone().map(|key| {
        (
            run.namespace_id.clone(),
            run.workflow_name.clone(),
            run.version.clone(),
            key,
        )
    })
}

struct Inner {
    runs: HashMap<String, WorkflowRun>,
    steps: HashMap<String, StepAttempt>,
}

/// `InMemoryStore` — a `parking_lot::Mutex`-guarded `HashMap` pair, used for tests and for
/// embedding applications that don't need a real database. Satisfies the same `Store` contract
/// as [`PostgresStore`](super::PostgresStore) bit-exactly.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                runs: HashMap::new(),
                steps: HashMap::new(),
            }),
        }
    }

    /// Number of workflow runs currently stored, across all namespaces. Test/debugging helper.
    pub fn run_count(&self) -> usize {
        self.inner.lock().runs.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor-paginates `items` (already filtered to the caller's namespace/criteria) in their
/// natural order (`desc` selects `createdAt DESC, id DESC`; otherwise `createdAt ASC, id ASC`).
/// Shared by `list_workflow_runs` and `list_step_attempts` — the only difference between the
/// two call sites is which field supplies `(created_at, id)` and which default order applies.
fn paginate<T: Clone>(
    mut items: Vec<T>,
    key: impl Fn(&T) -> (i64, String),
    desc: bool,
    page: &PageOptions,
    default_limit: i64,
) -> Result<Page<T>, StoreError> {
    let limit = page.limit_or_default(default_limit) as usize;

    let natural_cmp = |a: &(i64, String), b: &(i64, String)| -> CmpOrdering {
        if desc {
            b.cmp(a)
        } else {
            a.cmp(b)
        }
    };

    items.sort_by(|a, b| natural_cmp(&key(a), &key(b)));

    if let Some(after) = &page.after {
        let cursor = Cursor::decode(after)?;
        let cursor_key = (cursor.created_at_ms, cursor.id);
        let filtered: Vec<T> = items
            .into_iter()
            .filter(|item| natural_cmp(&key(item), &cursor_key) == CmpOrdering::Greater)
            .collect();
        let has_more = filtered.len() > limit;
        let data: Vec<T> = filtered.into_iter().take(limit).collect();
        let next = if has_more {
            data.last().map(|i| Cursor::new_from_key(key(i)).encode())
        } else {
            None
        };
        let prev = data.first().map(|i| Cursor::new_from_key(key(i)).encode());
        Ok(Page { data, next, prev })
    } else if let Some(before) = &page.before {
        let cursor = Cursor::decode(before)?;
        let cursor_key = (cursor.created_at_ms, cursor.id);
        let preceding: Vec<T> = items
            .into_iter()
            .filter(|item| natural_cmp(&key(item), &cursor_key) == CmpOrdering::Less)
            .collect();
        let mut nearest_first = preceding;
        nearest_first.reverse();
        let has_more = nearest_first.len() > limit;
        let mut data: Vec<T> = nearest_first.into_iter().take(limit).collect();
        data.reverse();
        let prev = if has_more {
            data.first().map(|i| Cursor::new_from_key(key(i)).encode())
        } else {
            None
        };
        let next = data.last().map(|i| Cursor::new_from_key(key(i)).encode());
        Ok(Page { data, next, prev })
    } else {
        let has_more = items.len() > limit;
        let data: Vec<T> = items.into_iter().take(limit).collect();
        let next = if has_more {
            data.last().map(|i| Cursor::new_from_key(key(i)).encode())
        } else {
            None
        };
        Ok(Page {
            data,
            next,
            prev: None,
        })
    }
}

impl Cursor {
    fn new_from_key(key: (i64, String)) -> Self {
        Self {
            created_at_ms: key.0,
            id: key.1,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    #[instrument(skip(self, params), fields(workflow_name = %params.workflow_name))]
    async fn create_workflow_run(
        &self,
        params: CreateWorkflowRunParams,
    ) -> Result<WorkflowRun, StoreError> {
        validate_concurrency_metadata(&params.concurrency_key, &params.concurrency_limit)?;

        let now = Utc::now();
        let mut inner = self.inner.lock();

        if let Some(idempotency_key) = &params.idempotency_key {
            let window_start = now - chrono::Duration::milliseconds(IDEMPOTENCY_WINDOW_MS);
            if let Some(existing) = inner.runs.values().find(|r| {
                r.namespace_id == params.namespace_id
                    && r.workflow_name == params.workflow_name
                    && r.idempotency_key.as_deref() == Some(idempotency_key.as_str())
                    && r.created_at >= window_start
            }) {
                debug!(run_id = %existing.id, "idempotent create returned existing run");
                return Ok(existing.clone());
            }
        }

        if let Some(key) = &params.concurrency_key {
            let mismatch = inner.runs.values().any(|r| {
                r.namespace_id == params.namespace_id
                    && r.workflow_name == params.workflow_name
                    && r.version == params.version
                    && r.concurrency_key.as_deref() == Some(key.as_str())
                    && r.status.is_active()
                    && r.status != RunStatus::Sleeping
                    && r.concurrency_limit != params.concurrency_limit
            });
            if mismatch {
                warn!(bucket = %key, "concurrency limit mismatch on create");
                return Err(StoreError::ConcurrencyLimitMismatch(format!(
                    "{}/{}/{}",
                    params.namespace_id,
                    params.workflow_name,
                    params.version.as_deref().unwrap_or("-")
                )));
            }
        }

        let run = WorkflowRun {
            namespace_id: params.namespace_id,
            id: Uuid::now_v7().to_string(),
            workflow_name: params.workflow_name,
            version: params.version,
            status: RunStatus::Pending,
            idempotency_key: params.idempotency_key,
            concurrency_key: params.concurrency_key,
            concurrency_limit: params.concurrency_limit,
            config: params.config,
            context: params.context,
            input: params.input,
            output: None,
            error: None,
            attempts: 0,
            worker_id: None,
            available_at: Some(params.available_at.unwrap_or(now)),
            deadline_at: params.deadline_at,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.runs.insert(run.id.clone(), run.clone());
        debug!(run_id = %run.id, "created workflow run");
        Ok(run)
    }

    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<WorkflowRun, StoreError> {
        self.inner
            .lock()
            .runs
            .get(id)
            .filter(|r| r.namespace_id == namespace_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))
    }

    async fn get_workflow_run_by_idempotency_key(
        &self,
        namespace_id: &str,
        workflow_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let window_start = Utc::now() - chrono::Duration::milliseconds(IDEMPOTENCY_WINDOW_MS);
        Ok(self
            .inner
            .lock()
            .runs
            .values()
            .find(|r| {
                r.namespace_id == namespace_id
                    && r.workflow_name == workflow_name
                    && r.idempotency_key.as_deref() == Some(idempotency_key)
                    && r.created_at >= window_start
            })
            .cloned())
    }

    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        filter: WorkflowRunFilter,
        page: PageOptions,
    ) -> Result<Page<WorkflowRun>, StoreError> {
        let items: Vec<WorkflowRun> = self
            .inner
            .lock()
            .runs
            .values()
            .filter(|r| r.namespace_id == namespace_id)
            .filter(|r| {
                filter
                    .workflow_name
                    .as_ref()
                    .map(|n| &r.workflow_name == n)
                    .unwrap_or(true)
            })
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();

        paginate(
            items,
            |r| (r.created_at.timestamp_millis(), r.id.clone()),
            true,
            &page,
            DEFAULT_PAGE_LIMIT,
        )
    }

    #[instrument(skip(self, params), fields(worker_id = %params.worker_id))]
    async fn claim_workflow_run(
        &self,
        params: ClaimParams,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        // Step 1: sweep expired deadlines.
        let expired_ids: Vec<String> = inner
            .runs
            .values()
            .filter(|r| {
                r.namespace_id == params.namespace_id
                    && r.status.is_active()
                    && r.deadline_at.is_some_and(|d| d <= now)
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &expired_ids {
            let run = inner.runs.get_mut(id).unwrap();
            run.status = RunStatus::Failed;
            run.error = Some(JsonError::new("Workflow run deadline exceeded"));
            run.finished_at = Some(now);
            run.available_at = None;
            run.worker_id = None;
            run.updated_at = now;
            warn!(run_id = %id, "workflow run deadline exceeded, marked failed");
        }

        // Step 2: select one claimable candidate under the concurrency predicate.
        let buckets: HashMap<(String, String, Option<String>, String), i32> = {
            let mut counts = HashMap::new();
            for r in inner.runs.values() {
                if r.status == RunStatus::Running && r.available_at.is_some_and(|a| a > now) {
                    if let Some(bucket) = concurrency_bucket(r) {
                        *counts.entry(bucket).or_insert(0) += 1;
                    }
                }
            }
            counts
        };

        let mut candidates: Vec<&WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| {
                r.namespace_id == params.namespace_id
                    && r.status.is_active()
                    && r.available_at.is_some_and(|a| a <= now)
                    && r.deadline_at.is_none_or(|d| d > now)
            })
            .filter(|r| match (&r.concurrency_key, r.concurrency_limit) {
                (Some(_), Some(limit)) => {
                    let bucket = concurrency_bucket(r).unwrap();
                    buckets.get(&bucket).copied().unwrap_or(0) < limit
                }
                _ => true,
            })
            .collect();

        // Pending runs are always preferred over expired running/sleeping; within that, oldest
        // availableAt, then oldest createdAt. `sleeping` is lumped with `running` in the
        // non-pending bucket, per the source's encoding — not subdivided further.
        candidates.sort_by(|a, b| {
            let a_rank = if a.status == RunStatus::Pending { 0 } else { 1 };
            let b_rank = if b.status == RunStatus::Pending { 0 } else { 1 };
            a_rank
                .cmp(&b_rank)
                .then_with(|| a.available_at.cmp(&b.available_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let chosen_id = candidates.first().map(|r| r.id.clone());
        drop(candidates);

        let Some(chosen_id) = chosen_id else {
            return Ok(None);
        };

        let available_at = now + chrono::Duration::milliseconds(params.lease_duration_ms);
        let run = inner.runs.get_mut(&chosen_id).unwrap();
        run.status = RunStatus::Running;
        run.attempts += 1;
        run.worker_id = Some(params.worker_id.clone());
        run.available_at = Some(available_at);
        run.started_at = run.started_at.or(Some(now));
        run.updated_at = now;
        debug!(run_id = %chosen_id, attempts = run.attempts, "claimed workflow run");
        Ok(Some(run.clone()))
    }

    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .filter(|r| r.namespace_id == namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status != RunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::PreconditionFailed(format!(
                "run {run_id} is not running under worker {worker_id}"
            )));
        }

        run.available_at = Some(now + chrono::Duration::milliseconds(lease_duration_ms));
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        available_at: Timestamp,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .filter(|r| r.namespace_id == namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() || run.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::FailedToSleep);
        }

        run.status = RunStatus::Sleeping;
        run.worker_id = None;
        run.available_at = Some(available_at);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        output: Option<serde_json::Value>,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .filter(|r| r.namespace_id == namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status != RunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(StoreError::PreconditionFailed(format!(
                "run {run_id} is not running under worker {worker_id}"
            )));
        }

        run.status = RunStatus::Completed;
        run.output = output;
        run.finished_at = Some(now);
        run.available_at = None;
        run.worker_id = None;
        run.updated_at = now;
        Ok(run.clone())
    }

    #[instrument(skip(self, params), fields(run_id = %params.run_id))]
    async fn fail_workflow_run(
        &self,
        params: FailWorkflowRunParams<'_>,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&params.run_id)
            .filter(|r| r.namespace_id == params.namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(params.run_id.clone()))?;

        if run.status != RunStatus::Running || run.worker_id.as_deref() != Some(&params.worker_id)
        {
            return Err(StoreError::PreconditionFailed(format!(
                "run {} is not running under worker {}",
                params.run_id, params.worker_id
            )));
        }

        let update = compute_failed_workflow_run_update(
            params.retry_policy,
            run.attempts as u32,
            run.deadline_at,
            params.error,
            now,
        );

        run.status = update.status;
        run.available_at = update.available_at;
        run.finished_at = update.finished_at;
        run.error = Some(update.error);
        // Always cleared, regardless of whether the run is rescheduled or now terminal.
        run.worker_id = None;
        run.started_at = None;
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        params: RescheduleParams,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(&params.run_id)
            .filter(|r| r.namespace_id == params.namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(params.run_id.clone()))?;

        if run.status != RunStatus::Running || run.worker_id.as_deref() != Some(&params.worker_id)
        {
            return Err(StoreError::PreconditionFailed(format!(
                "run {} is not running under worker {}",
                params.run_id, params.worker_id
            )));
        }

        run.status = RunStatus::Pending;
        run.available_at = Some(params.available_at);
        run.error = Some(params.error);
        run.worker_id = None;
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .filter(|r| r.namespace_id == namespace_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status == RunStatus::Canceled {
            return Ok(run.clone());
        }
        if run.status.is_terminal() {
            return Err(StoreError::CannotCancel(run_id.to_string(), run.status.as_str()));
        }

        run.status = RunStatus::Canceled;
        run.worker_id = None;
        run.available_at = None;
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn create_step_attempt(
        &self,
        params: CreateStepAttemptParams,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let attempt = StepAttempt {
            namespace_id: params.namespace_id,
            id: Uuid::now_v7().to_string(),
            workflow_run_id: params.workflow_run_id,
            step_name: params.step_name,
            kind: params.kind,
            status: StepStatus::Running,
            config: params.config,
            context: params.context,
            output: None,
            error: None,
            started_at: now,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .lock()
            .steps
            .insert(attempt.id.clone(), attempt.clone());
        Ok(attempt)
    }

    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<StepAttempt, StoreError> {
        self.inner
            .lock()
            .steps
            .get(id)
            .filter(|a| a.namespace_id == namespace_id)
            .cloned()
            .ok_or_else(|| StoreError::StepAttemptNotFound(id.to_string()))
    }

    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        workflow_run_id: &str,
        page: PageOptions,
    ) -> Result<Page<StepAttempt>, StoreError> {
        let items: Vec<StepAttempt> = self
            .inner
            .lock()
            .steps
            .values()
            .filter(|a| a.namespace_id == namespace_id && a.workflow_run_id == workflow_run_id)
            .cloned()
            .collect();

        paginate(
            items,
            |a| (a.created_at.timestamp_millis(), a.id.clone()),
            false,
            &page,
            DEFAULT_PAGE_LIMIT,
        )
    }

    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        output: Option<serde_json::Value>,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let run_id = inner
            .steps
            .get(id)
            .filter(|a| a.namespace_id == namespace_id)
            .map(|a| a.workflow_run_id.clone())
            .ok_or(StoreError::FailedToCompleteStepAttempt)?;
        let run_ok = inner
            .runs
            .get(&run_id)
            .is_some_and(|r| r.status == RunStatus::Running && r.worker_id.as_deref() == Some(worker_id));
        if !run_ok {
            return Err(StoreError::FailedToCompleteStepAttempt);
        }

        let attempt = inner
            .steps
            .get_mut(id)
            .filter(|a| a.namespace_id == namespace_id)
            .ok_or(StoreError::FailedToCompleteStepAttempt)?;
        if attempt.status != StepStatus::Running {
            return Err(StoreError::FailedToCompleteStepAttempt);
        }

        attempt.status = StepStatus::Completed;
        attempt.output = output;
        attempt.finished_at = Some(now);
        attempt.updated_at = now;
        Ok(attempt.clone())
    }

    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        error: JsonError,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let run_id = inner
            .steps
            .get(id)
            .filter(|a| a.namespace_id == namespace_id)
            .map(|a| a.workflow_run_id.clone())
            .ok_or(StoreError::FailedToFailStepAttempt)?;
        let run_ok = inner
            .runs
            .get(&run_id)
            .is_some_and(|r| r.status == RunStatus::Running && r.worker_id.as_deref() == Some(worker_id));
        if !run_ok {
            return Err(StoreError::FailedToFailStepAttempt);
        }

        let attempt = inner
            .steps
            .get_mut(id)
            .filter(|a| a.namespace_id == namespace_id)
            .ok_or(StoreError::FailedToFailStepAttempt)?;
        if attempt.status != StepStatus::Running {
            return Err(StoreError::FailedToFailStepAttempt);
        }

        attempt.status = StepStatus::Failed;
        attempt.error = Some(error);
        attempt.finished_at = Some(now);
        attempt.updated_at = now;
        Ok(attempt.clone())
    }
}
