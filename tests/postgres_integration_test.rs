//! Integration tests against a real Postgres instance.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test --test postgres_integration_test -- --test-threads=1`
//!
//! Single-threaded because tests share one `namespace_id` and would otherwise race each
//! other's claim scans. Skipped (with a logged message) when `DATABASE_URL` is unset, so a
//! contributor without a database running still gets a clean `cargo test`.

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use everruns_durable::persistence::{
    ClaimParams, CreateStepAttemptParams, CreateWorkflowRunParams, JsonError, PageOptions,
    PostgresStore, RunStatus, Store, StoreError, StepKind,
};
use everruns_durable::reliability::RetryPolicy;

async fn test_store() -> Option<PostgresStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping postgres_integration_test: DATABASE_URL is not set");
        return None;
    };
    let pool = PgPool::connect(&database_url)
        .await
        .expect("failed to connect to postgres; is it running and migrated?");
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Some(PostgresStore::from_pool(pool))
}

fn namespace() -> String {
    format!("it-{}", Uuid::now_v7())
}

fn params(namespace_id: &str, workflow_name: &str) -> CreateWorkflowRunParams {
    CreateWorkflowRunParams {
        namespace_id: namespace_id.into(),
        workflow_name: workflow_name.into(),
        version: None,
        idempotency_key: None,
        concurrency_key: None,
        concurrency_limit: None,
        config: json!({}),
        context: None,
        input: Some(json!({"n": 1})),
        available_at: None,
        deadline_at: None,
    }
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    let run = store.create_workflow_run(params(&ns, "greet")).await.unwrap();
    let fetched = store.get_workflow_run(&ns, &run.id).await.unwrap();
    assert_eq!(fetched.id, run.id);
    assert_eq!(fetched.status, RunStatus::Pending);
}

#[tokio::test]
async fn idempotent_create_collapses_to_one_row() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    let mut p = params(&ns, "greet");
    p.idempotency_key = Some("key-1".into());

    let first = store.create_workflow_run(p.clone()).await.unwrap();
    let second = store.create_workflow_run(p).await.unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn concurrency_limit_caps_active_leases() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    for _ in 0..3 {
        let mut p = params(&ns, "limited");
        p.concurrency_key = Some("bucket".into());
        p.concurrency_limit = Some(1);
        store.create_workflow_run(p).await.unwrap();
    }

    let first = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w1".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap();
    assert!(first.is_some());

    let second = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w2".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn claim_marks_expired_deadline_as_failed() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    let mut p = params(&ns, "deadline");
    p.deadline_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    let run = store.create_workflow_run(p).await.unwrap();

    let claimed = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w1".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap();
    assert!(claimed.is_none());

    let fetched = store.get_workflow_run(&ns, &run.id).await.unwrap();
    assert_eq!(fetched.status, RunStatus::Failed);
    assert_eq!(fetched.error.unwrap().message, "Workflow run deadline exceeded");
}

#[tokio::test]
async fn fail_reschedules_then_terminates_per_retry_policy() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();
    let policy = RetryPolicy::exponential().with_max_attempts(2);

    store.create_workflow_run(params(&ns, "always_fails")).await.unwrap();

    let claimed = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w1".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap()
        .unwrap();

    let after_first = store
        .fail_workflow_run(everruns_durable::persistence::FailWorkflowRunParams {
            namespace_id: ns.clone(),
            run_id: claimed.id.clone(),
            worker_id: "w1".into(),
            error: JsonError::new("boom"),
            retry_policy: &policy,
        })
        .await
        .unwrap();
    assert_eq!(after_first.status, RunStatus::Pending);

    let reclaimed = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w2".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.attempts, 2);

    let after_second = store
        .fail_workflow_run(everruns_durable::persistence::FailWorkflowRunParams {
            namespace_id: ns.clone(),
            run_id: reclaimed.id.clone(),
            worker_id: "w2".into(),
            error: JsonError::new("boom again"),
            retry_policy: &policy,
        })
        .await
        .unwrap();
    assert_eq!(after_second.status, RunStatus::Failed);
    assert!(after_second.finished_at.is_some());
}

#[tokio::test]
async fn cancel_is_idempotent_and_rejects_terminal() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    let run = store.create_workflow_run(params(&ns, "greet")).await.unwrap();
    let canceled = store.cancel_workflow_run(&ns, &run.id).await.unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);

    let again = store.cancel_workflow_run(&ns, &run.id).await.unwrap();
    assert_eq!(again.status, RunStatus::Canceled);

    let completed_run = store.create_workflow_run(params(&ns, "greet")).await.unwrap();
    let claimed = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w1".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, completed_run.id);
    store
        .complete_workflow_run(&ns, &claimed.id, "w1", Some(json!("done")))
        .await
        .unwrap();

    let err = store.cancel_workflow_run(&ns, &completed_run.id).await.unwrap_err();
    assert!(matches!(err, StoreError::CannotCancel(_, "completed")));
}

#[tokio::test]
async fn step_attempt_lifecycle_and_pagination() {
    let Some(store) = test_store().await else { return };
    let ns = namespace();

    let run = store.create_workflow_run(params(&ns, "stepper")).await.unwrap();
    let claimed = store
        .claim_workflow_run(ClaimParams {
            namespace_id: ns.clone(),
            worker_id: "w1".into(),
            lease_duration_ms: 30_000,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, run.id);

    for name in ["a", "b", "c"] {
        let attempt = store
            .create_step_attempt(CreateStepAttemptParams {
                namespace_id: ns.clone(),
                workflow_run_id: run.id.clone(),
                step_name: name.into(),
                kind: StepKind::Function,
                config: json!({}),
                context: None,
            })
            .await
            .unwrap();
        store
            .complete_step_attempt(&ns, &attempt.id, "w1", Some(json!(name)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let page = store
        .list_step_attempts(
            &ns,
            &run.id,
            PageOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[0].step_name, "a");
    assert!(page.next.is_some());

    let page2 = store
        .list_step_attempts(
            &ns,
            &run.id,
            PageOptions {
                after: page.next.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page2.data.len(), 1);
    assert_eq!(page2.data[0].step_name, "c");
}

#[tokio::test]
async fn concurrent_claims_never_double_lease_the_same_run() {
    let Some(store) = test_store().await else { return };
    let store = std::sync::Arc::new(store);
    let ns = namespace();

    for _ in 0..20 {
        store.create_workflow_run(params(&ns, "racy")).await.unwrap();
    }

    let claim = |worker_id: &'static str| {
        let store = store.clone();
        let ns = ns.clone();
        async move {
            let mut claimed = Vec::new();
            loop {
                match store
                    .claim_workflow_run(ClaimParams {
                        namespace_id: ns.clone(),
                        worker_id: worker_id.into(),
                        lease_duration_ms: 30_000,
                    })
                    .await
                    .unwrap()
                {
                    Some(run) => claimed.push(run.id),
                    None => break,
                }
            }
            claimed
        }
    };

    let (a, b, c) = tokio::join!(claim("w1"), claim("w2"), claim("w3"));

    let mut all_ids: Vec<String> = a.into_iter().chain(b).chain(c).collect();
    let total = all_ids.len();
    all_ids.sort();
    all_ids.dedup();
    assert_eq!(all_ids.len(), total, "no run should be claimed twice");
    assert_eq!(total, 20);
}
