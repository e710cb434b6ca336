//! Postgres-backed [`Store`]: the production implementation. Claims use
//! `FOR UPDATE SKIP LOCKED`, idempotent creation is serialized with a transaction-scoped
//! advisory lock, and cursor pagination is a tuple comparison pushed into SQL rather than
//! sorted in the application.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::reliability::compute_failed_workflow_run_update;

const IDEMPOTENCY_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const DEFAULT_PAGE_LIMIT: i64 = 50;

/// `PostgresStore` — the production [`Store`]. Owns a connection pool and embeds its own
/// migrations, applied on [`PostgresStore::connect`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects and runs pending migrations. Mirrors the rest of the crate's configuration
    /// convention: plain constructor parameters, no config file or env var reads here — callers
    /// wanting `DATABASE_URL`-from-env do that themselves (see the crate's `dotenvy` usage in
    /// examples and tests).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn advisory_lock_key(namespace_id: &str, workflow_name: &str, idempotency_key: &str) -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    namespace_id.hash(&mut hasher);
    workflow_name.hash(&mut hasher);
    idempotency_key.hash(&mut hasher);
    hasher.finish() as i64
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn error_to_json(error: &JsonError) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(error)?)
}

fn decode_cursor_bound(
    raw: &Option<String>,
) -> Result<(Option<DateTime<Utc>>, Option<String>), StoreError> {
    match raw {
        None => Ok((None, None)),
        Some(c) => {
            let cursor = Cursor::decode(c)?;
            let ts = DateTime::<Utc>::from_timestamp_millis(cursor.created_at_ms)
                .ok_or_else(|| StoreError::InvalidCursor("timestamp out of range".into()))?;
            Ok((Some(ts), Some(cursor.id)))
        }
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Result<WorkflowRun, StoreError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let error_raw: Option<Value> = row.try_get("error").map_err(db_err)?;
    Ok(WorkflowRun {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: row.try_get("id").map_err(db_err)?,
        workflow_name: row.try_get("workflow_name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        status: RunStatus::parse(&status_raw)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        concurrency_key: row.try_get("concurrency_key").map_err(db_err)?,
        concurrency_limit: row.try_get("concurrency_limit").map_err(db_err)?,
        config: row.try_get("config").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        input: row.try_get("input").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        error: error_raw
            .map(serde_json::from_value::<JsonError>)
            .transpose()?,
        attempts: row.try_get("attempts").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        available_at: row.try_get("available_at").map_err(db_err)?,
        deadline_at: row.try_get("deadline_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<StepAttempt, StoreError> {
    let kind_raw: String = row.try_get("kind").map_err(db_err)?;
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let error_raw: Option<Value> = row.try_get("error").map_err(db_err)?;
    Ok(StepAttempt {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: row.try_get("id").map_err(db_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        step_name: row.try_get("step_name").map_err(db_err)?,
        kind: StepKind::parse(&kind_raw)?,
        status: StepStatus::parse(&status_raw)?,
        config: row.try_get("config").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        error: error_raw
            .map(serde_json::from_value::<JsonError>)
            .transpose()?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

/// Folds a `limit + 1`-row fetch (already ordered nearest-to-cursor-first) into a page, mirroring
/// [`InMemoryStore`](super::InMemoryStore)'s `paginate` helper bit-for-bit: `before` queries are
/// reversed back into chronological order after the `has_more` bit is read off the raw count.
fn fold_page<T: Clone>(
    mut rows: Vec<T>,
    limit: i64,
    using_before: bool,
    cursor_of: impl Fn(&T) -> String,
) -> Page<T> {
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);
    if using_before {
        rows.reverse();
    }

    let (next, prev) = if using_before {
        let prev = if has_more {
            rows.first().map(&cursor_of)
        } else {
            None
        };
        let next = rows.last().map(&cursor_of);
        (next, prev)
    } else {
        let next = if has_more {
            rows.last().map(&cursor_of)
        } else {
            None
        };
        let prev = rows.first().map(&cursor_of);
        (next, prev)
    };

    Page {
        data: rows,
        next,
        prev,
    }
}

#[async_trait::async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, params), fields(workflow_name = %params.workflow_name))]
    async fn create_workflow_run(
        &self,
        params: CreateWorkflowRunParams,
    ) -> Result<WorkflowRun, StoreError> {
        if let (Some(k), Some(l)) = (&params.concurrency_key, params.concurrency_limit) {
            if k.trim().is_empty() || l <= 0 {
                return Err(StoreError::InvalidConcurrencyMetadata);
            }
        } else if params.concurrency_key.is_some() != params.concurrency_limit.is_some() {
            return Err(StoreError::InvalidConcurrencyMetadata);
        }

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await.map_err(db_err)?;

        if let Some(idempotency_key) = &params.idempotency_key {
            // Serializes concurrent creates sharing this (namespace, workflow, key) tuple so the
            // existence check below and the eventual insert can't race each other.
            let lock_key =
                advisory_lock_key(&params.namespace_id, &params.workflow_name, idempotency_key);
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(lock_key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            let window_start =
                Utc::now() - chrono::Duration::milliseconds(IDEMPOTENCY_WINDOW_MS);
            let existing = sqlx::query(
                r#"
                SELECT * FROM workflow_runs
                WHERE namespace_id = $1
                  AND workflow_name = $2
                  AND idempotency_key = $3
                  AND created_at >= $4
                ORDER BY created_at DESC
                LIMIT 1
                "#,
            )
            .bind(&params.namespace_id)
            .bind(&params.workflow_name)
            .bind(idempotency_key)
            .bind(window_start)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if let Some(row) = existing {
                let run = row_to_run(&row)?;
                tx.commit().await.map_err(db_err)?;
                debug!(run_id = %run.id, "idempotent create returned existing run");
                return Ok(run);
            }
        }

        if let Some(key) = &params.concurrency_key {
            let mismatch = sqlx::query(
                r#"
                SELECT 1 FROM workflow_runs
                WHERE namespace_id = $1
                  AND workflow_name = $2
                  AND version IS NOT DISTINCT FROM $3
                  AND concurrency_key = $4
                  AND status IN ('pending', 'running')
                  AND concurrency_limit IS DISTINCT FROM $5
                LIMIT 1
                "#,
            )
            .bind(&params.namespace_id)
            .bind(&params.workflow_name)
            .bind(&params.version)
            .bind(key)
            .bind(params.concurrency_limit)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if mismatch.is_some() {
                warn!(bucket = %key, "concurrency limit mismatch on create");
                return Err(StoreError::ConcurrencyLimitMismatch(format!(
                    "{}/{}/{}",
                    params.namespace_id,
                    params.workflow_name,
                    params.version.as_deref().unwrap_or("-")
                )));
            }
        }

        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let available_at = params.available_at.unwrap_or(now);

        let row = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                namespace_id, id, workflow_name, version, status, idempotency_key,
                concurrency_key, concurrency_limit, config, context, input,
                available_at, deadline_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, $13, $13
            )
            RETURNING *
            "#,
        )
        .bind(&params.namespace_id)
        .bind(&id)
        .bind(&params.workflow_name)
        .bind(&params.version)
        .bind(&params.idempotency_key)
        .bind(&params.concurrency_key)
        .bind(params.concurrency_limit)
        .bind(&params.config)
        .bind(&params.context)
        .bind(&params.input)
        .bind(available_at)
        .bind(params.deadline_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(run_id = %id, "created workflow run");
        row_to_run(&row)
    }

    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<WorkflowRun, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = $1 AND id = $2")
            .bind(namespace_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?;
        row_to_run(&row)
    }

    async fn get_workflow_run_by_idempotency_key(
        &self,
        namespace_id: &str,
        workflow_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let window_start = Utc::now() - chrono::Duration::milliseconds(IDEMPOTENCY_WINDOW_MS);
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_runs
            WHERE namespace_id = $1 AND workflow_name = $2 AND idempotency_key = $3
              AND created_at >= $4
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(namespace_id)
        .bind(workflow_name)
        .bind(idempotency_key)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        filter: WorkflowRunFilter,
        page: PageOptions,
    ) -> Result<Page<WorkflowRun>, StoreError> {
        let limit = page.limit_or_default(DEFAULT_PAGE_LIMIT);
        let status_str = filter.status.map(|s| s.as_str().to_string());
        let using_before = page.before.is_some();
        let (bound_ts, bound_id) = decode_cursor_bound(if using_before { &page.before } else { &page.after })?;
        // Natural order is `createdAt DESC, id DESC` (newest first). Walking forward from an
        // `after` cursor continues in that same order; walking backward from a `before` cursor
        // means fetching the nearest newer rows first (ascending), then reversing in
        // `fold_page` to restore natural order — same trick `InMemoryStore` uses in Rust.
        let cmp_op = if using_before { ">" } else { "<" };
        let order = if using_before { "ASC" } else { "DESC" };

        let query = format!(
            r#"
            SELECT * FROM workflow_runs
            WHERE namespace_id = $1
              AND ($2::text IS NULL OR workflow_name = $2)
              AND ($3::text IS NULL OR status = $3 OR ($3 = 'completed' AND status = 'succeeded'))
              AND ($4::timestamptz IS NULL OR (created_at, id) {cmp_op} ($4, $5))
            ORDER BY created_at {order}, id {order}
            LIMIT $6
            "#
        );

        let rows = sqlx::query(&query)
            .bind(namespace_id)
            .bind(&filter.workflow_name)
            .bind(&status_str)
            .bind(bound_ts)
            .bind(&bound_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let runs = rows.iter().map(row_to_run).collect::<Result<Vec<_>, _>>()?;
        Ok(fold_page(runs, limit, using_before, |r| {
            Cursor::new(r.created_at, &r.id).encode()
        }))
    }

    #[instrument(skip(self, params), fields(worker_id = %params.worker_id))]
    async fn claim_workflow_run(
        &self,
        params: ClaimParams,
    ) -> Result<Option<WorkflowRun>, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed',
                error = $3,
                finished_at = $2,
                available_at = NULL,
                worker_id = NULL,
                updated_at = $2
            WHERE namespace_id = $1
              AND status IN ('pending', 'running', 'sleeping')
              AND deadline_at IS NOT NULL
              AND deadline_at <= $2
            "#,
        )
        .bind(&params.namespace_id)
        .bind(now)
        .bind(serde_json::to_value(JsonError::new(
            "Workflow run deadline exceeded",
        ))?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let available_at = now + chrono::Duration::milliseconds(params.lease_duration_ms);

        // Selects the best candidate under a per-bucket concurrency cap, locking it against
        // concurrent claimers with `FOR UPDATE SKIP LOCKED` before flipping it to `running`.
        let row = sqlx::query(
            r#"
            WITH active_counts AS (
                SELECT workflow_name, version, concurrency_key, count(*) AS n
                FROM workflow_runs
                WHERE namespace_id = $1
                  AND status = 'running'
                  AND available_at > $2
                  AND concurrency_key IS NOT NULL
                GROUP BY workflow_name, version, concurrency_key
            ),
            candidate AS (
                SELECT wr.id
                FROM workflow_runs wr
                LEFT JOIN active_counts ac
                  ON wr.concurrency_key IS NOT NULL
                 AND ac.workflow_name = wr.workflow_name
                 AND ac.version IS NOT DISTINCT FROM wr.version
                 AND ac.concurrency_key = wr.concurrency_key
                WHERE wr.namespace_id = $1
                  AND wr.status IN ('pending', 'running', 'sleeping')
                  AND wr.available_at <= $2
                  AND (wr.deadline_at IS NULL OR wr.deadline_at > $2)
                  AND (
                        wr.concurrency_key IS NULL
                        OR wr.concurrency_limit IS NULL
                        OR coalesce(ac.n, 0) < wr.concurrency_limit
                      )
                ORDER BY (wr.status != 'pending'), wr.available_at ASC, wr.created_at ASC
                FOR UPDATE OF wr SKIP LOCKED
                LIMIT 1
            )
            UPDATE workflow_runs
            SET status = 'running',
                attempts = workflow_runs.attempts + 1,
                worker_id = $3,
                available_at = $4,
                started_at = coalesce(workflow_runs.started_at, $2),
                updated_at = $2
            FROM candidate
            WHERE workflow_runs.id = candidate.id
            RETURNING workflow_runs.*
            "#,
        )
        .bind(&params.namespace_id)
        .bind(now)
        .bind(&params.worker_id)
        .bind(available_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        match row {
            Some(row) => {
                let run = row_to_run(&row)?;
                debug!(run_id = %run.id, attempts = run.attempts, "claimed workflow run");
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let available_at = now + chrono::Duration::milliseconds(lease_duration_ms);
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET available_at = $4, updated_at = $3
            WHERE namespace_id = $1 AND id = $2
              AND status = 'running' AND worker_id = $5
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(now)
        .bind(available_at)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::PreconditionFailed(format!(
                "run {run_id} is not running under worker {worker_id}"
            ))
        })?;
        row_to_run(&row)
    }

    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        available_at: Timestamp,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'sleeping', worker_id = NULL, available_at = $4, updated_at = $3
            WHERE namespace_id = $1 AND id = $2
              AND status NOT IN ('completed', 'failed', 'canceled')
              AND worker_id = $5
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(now)
        .bind(available_at)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::FailedToSleep)?;
        row_to_run(&row)
    }

    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
        worker_id: &str,
        output: Option<Value>,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'completed', output = $4, finished_at = $3,
                available_at = NULL, worker_id = NULL, updated_at = $3
            WHERE namespace_id = $1 AND id = $2
              AND status = 'running' AND worker_id = $5
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(now)
        .bind(output)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::PreconditionFailed(format!(
                "run {run_id} is not running under worker {worker_id}"
            ))
        })?;
        row_to_run(&row)
    }

    #[instrument(skip(self, params), fields(run_id = %params.run_id))]
    async fn fail_workflow_run(
        &self,
        params: FailWorkflowRunParams<'_>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let current = sqlx::query(
            "SELECT * FROM workflow_runs WHERE namespace_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(&params.namespace_id)
        .bind(&params.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::RunNotFound(params.run_id.clone()))?;
        let current = row_to_run(&current)?;

        if current.status != RunStatus::Running
            || current.worker_id.as_deref() != Some(&params.worker_id)
        {
            return Err(StoreError::PreconditionFailed(format!(
                "run {} is not running under worker {}",
                params.run_id, params.worker_id
            )));
        }

        let now = Utc::now();
        let update = compute_failed_workflow_run_update(
            params.retry_policy,
            current.attempts as u32,
            current.deadline_at,
            params.error,
            now,
        );

        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $3, available_at = $4, finished_at = $5, error = $6,
                worker_id = NULL, started_at = NULL, updated_at = $7
            WHERE namespace_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(&params.namespace_id)
        .bind(&params.run_id)
        .bind(update.status.as_str())
        .bind(update.available_at)
        .bind(update.finished_at)
        .bind(error_to_json(&update.error)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        row_to_run(&row)
    }

    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        params: RescheduleParams,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'pending', available_at = $4, error = $5,
                worker_id = NULL, updated_at = $3
            WHERE namespace_id = $1 AND id = $2
              AND status = 'running' AND worker_id = $6
            RETURNING *
            "#,
        )
        .bind(&params.namespace_id)
        .bind(&params.run_id)
        .bind(now)
        .bind(params.available_at)
        .bind(error_to_json(&params.error)?)
        .bind(&params.worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::PreconditionFailed(format!(
                "run {} is not running under worker {}",
                params.run_id, params.worker_id
            ))
        })?;
        row_to_run(&row)
    }

    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: &str,
    ) -> Result<WorkflowRun, StoreError> {
        let now = Utc::now();
        let current = self.get_workflow_run(namespace_id, run_id).await?;

        if current.status == RunStatus::Canceled {
            return Ok(current);
        }
        if current.status.is_terminal() {
            return Err(StoreError::CannotCancel(
                run_id.to_string(),
                current.status.as_str(),
            ));
        }

        let row = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'canceled', worker_id = NULL, available_at = NULL,
                finished_at = $3, updated_at = $3
            WHERE namespace_id = $1 AND id = $2
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_run(&row)
    }

    async fn create_step_attempt(
        &self,
        params: CreateStepAttemptParams,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let id = Uuid::now_v7().to_string();
        let row = sqlx::query(
            r#"
            INSERT INTO step_attempts (
                namespace_id, id, workflow_run_id, step_name, kind, status,
                config, context, started_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $8, $8, $8)
            RETURNING *
            "#,
        )
        .bind(&params.namespace_id)
        .bind(&id)
        .bind(&params.workflow_run_id)
        .bind(&params.step_name)
        .bind(params.kind.as_str())
        .bind(&params.config)
        .bind(&params.context)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_step(&row)
    }

    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
    ) -> Result<StepAttempt, StoreError> {
        let row = sqlx::query("SELECT * FROM step_attempts WHERE namespace_id = $1 AND id = $2")
            .bind(namespace_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::StepAttemptNotFound(id.to_string()))?;
        row_to_step(&row)
    }

    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        workflow_run_id: &str,
        page: PageOptions,
    ) -> Result<Page<StepAttempt>, StoreError> {
        let limit = page.limit_or_default(DEFAULT_PAGE_LIMIT);
        let using_before = page.before.is_some();
        let (bound_ts, bound_id) =
            decode_cursor_bound(if using_before { &page.before } else { &page.after })?;
        // Step attempts paginate in ascending (creation) order; `before` walks backward through
        // it, same inversion the in-memory store applies.
        let cmp_op = if using_before { "<" } else { ">" };
        let order = if using_before { "DESC" } else { "ASC" };

        let query = format!(
            r#"
            SELECT * FROM step_attempts
            WHERE namespace_id = $1 AND workflow_run_id = $2
              AND ($3::timestamptz IS NULL OR (created_at, id) {cmp_op} ($3, $4))
            ORDER BY created_at {order}, id {order}
            LIMIT $5
            "#
        );

        let rows = sqlx::query(&query)
            .bind(namespace_id)
            .bind(workflow_run_id)
            .bind(bound_ts)
            .bind(&bound_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let attempts = rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?;
        Ok(fold_page(attempts, limit, using_before, |a| {
            Cursor::new(a.created_at, &a.id).encode()
        }))
    }

    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        output: Option<Value>,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE step_attempts sa
            SET status = 'completed', output = $4, finished_at = $3, updated_at = $3
            FROM workflow_runs wr
            WHERE sa.namespace_id = $1 AND sa.id = $2
              AND sa.status = 'running'
              AND wr.namespace_id = sa.namespace_id AND wr.id = sa.workflow_run_id
              AND wr.status = 'running' AND wr.worker_id = $5
            RETURNING sa.*
            "#,
        )
        .bind(namespace_id)
        .bind(id)
        .bind(now)
        .bind(output)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::FailedToCompleteStepAttempt)?;
        row_to_step(&row)
    }

    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        id: &str,
        worker_id: &str,
        error: JsonError,
    ) -> Result<StepAttempt, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE step_attempts sa
            SET status = 'failed', error = $4, finished_at = $3, updated_at = $3
            FROM workflow_runs wr
            WHERE sa.namespace_id = $1 AND sa.id = $2
              AND sa.status = 'running'
              AND wr.namespace_id = sa.namespace_id AND wr.id = sa.workflow_run_id
              AND wr.status = 'running' AND wr.worker_id = $5
            RETURNING sa.*
            "#,
        )
        .bind(namespace_id)
        .bind(id)
        .bind(now)
        .bind(error_to_json(&error)?)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::FailedToFailStepAttempt)?;
        row_to_step(&row)
    }
}
