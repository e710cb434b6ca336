//! The worker dispatcher: runs `concurrency` concurrent processors, polling the Store for
//! claimable runs and heartbeating leases while a processor is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::LoadState;
use super::poller::PollerConfig;
use crate::engine::{RunProcessor, WorkflowRegistry};
use crate::persistence::{ClaimParams, JsonError, Store, StoreError, WorkflowRun};
use crate::reliability::RetryPolicy;

/// Worker configuration: how many processors run concurrently, how long to wait between empty
/// poll passes, and how long a claimed lease lasts before it must be renewed or reclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poller: PollerConfig,
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poller: PollerConfig::default(),
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_poll_interval(interval);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("worker is not running")]
    NotRunning,
}

/// Process-wide dispatcher over a fixed pool of `concurrency` opaque worker IDs.
///
/// Each slot, once claimed, is bound to one in-flight [`RunProcessor`] and heartbeated at
/// `leaseDuration / 2` until that processor returns, at which point the slot's worker ID goes
/// back into the free pool. No claim is ever issued for an occupied slot — the Store's
/// per-bucket concurrency predicate is an independent, second layer of limiting.
pub struct Worker {
    store: Arc<dyn Store>,
    namespace_id: String,
    registry: Arc<WorkflowRegistry>,
    config: WorkerConfig,
    load: Arc<LoadState>,
    slots: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    free_ids_tx: mpsc::Sender<String>,
    free_ids_rx: tokio::sync::Mutex<Option<mpsc::Receiver<String>>>,
    main_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        namespace_id: impl Into<String>,
        registry: WorkflowRegistry,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (free_ids_tx, free_ids_rx) = mpsc::channel(config.concurrency);
        for _ in 0..config.concurrency {
            let _ = free_ids_tx.try_send(format!("worker-{}", Uuid::now_v7()));
        }

        Self {
            store,
            namespace_id: namespace_id.into(),
            registry: Arc::new(registry),
            load: Arc::new(LoadState::new(config.concurrency)),
            slots: Arc::new(Semaphore::new(config.concurrency)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            free_ids_tx,
            free_ids_rx: tokio::sync::Mutex::new(Some(free_ids_rx)),
            config,
            main_loop: std::sync::Mutex::new(None),
        }
    }

    pub fn current_load(&self) -> usize {
        self.load.current_load()
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::AlreadyRunning);
        }
        info!(concurrency = self.config.concurrency, "starting worker");

        let store = self.store.clone();
        let namespace_id = self.namespace_id.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let load = self.load.clone();
        let slots = self.slots.clone();
        let running = self.running.clone();
        let free_ids_tx = self.free_ids_tx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut free_ids_rx = self
            .free_ids_rx
            .lock()
            .await
            .take()
            .expect("worker already started");

        let handle = tokio::spawn(async move {
            loop {
                if !running.load(Ordering::Acquire) {
                    break;
                }

                let available = match recv_available_ids(&mut free_ids_rx, &mut shutdown_rx).await {
                    Some(ids) => ids,
                    None => break,
                };
                if available.is_empty() {
                    continue;
                }

                let claimed = claim_all(&store, &namespace_id, config.lease_duration, available).await;
                let claimed_count = claimed.iter().filter(|(_, r)| matches!(r, Ok(Some(_)))).count();

                for (worker_id, result) in claimed {
                    dispatch_claim(
                        &store,
                        &namespace_id,
                        &registry,
                        &load,
                        &slots,
                        &free_ids_tx,
                        config.lease_duration,
                        worker_id,
                        result,
                    )
                    .await;
                }

                if claimed_count == 0
                    && wait_or_shutdown(config.poller.poll_interval, &mut shutdown_rx).await
                {
                    break;
                }
            }
            debug!("worker main loop exited");
        });

        *self.main_loop.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Test-only: performs one poll-and-dispatch pass synchronously, awaiting every claimed
    /// run's processor inline rather than spawning it in the background. Does not start or
    /// require the background main loop.
    pub async fn tick(&self) -> Result<usize, WorkerError> {
        let mut guard = self.free_ids_rx.lock().await;
        let rx = guard.as_mut().expect("worker's receiver was moved into its background loop");
        let available = drain_ready_ids(rx).await;
        drop(guard);
        if available.is_empty() {
            return Ok(0);
        }

        let claimed = claim_all(
            &self.store,
            &self.namespace_id,
            self.config.lease_duration,
            available,
        )
        .await;
        let claimed_count = claimed.iter().filter(|(_, r)| matches!(r, Ok(Some(_)))).count();

        for (worker_id, result) in claimed {
            match result {
                Ok(Some(run)) => {
                    self.run_claim_to_completion(worker_id.clone(), run).await;
                }
                Ok(None) => {
                    let _ = self.free_ids_tx.send(worker_id).await;
                }
                Err(e) => {
                    warn!(error = %e, "claim failed during tick");
                    let _ = self.free_ids_tx.send(worker_id).await;
                }
            }
        }

        Ok(claimed_count)
    }

    async fn run_claim_to_completion(&self, worker_id: String, run: WorkflowRun) {
        let resolved = self.registry.resolve(&run.workflow_name, run.version.as_deref()).cloned();
        match resolved {
            Some(workflow) => {
                let processor = RunProcessor::new(self.store.clone());
                if let Err(e) = processor.process(run, &workflow).await {
                    error!(error = %e, "processor failed");
                }
            }
            None => {
                fail_unregistered(&self.store, &run, &worker_id).await;
            }
        }
        let _ = self.free_ids_tx.send(worker_id).await;
    }

    /// Sets the stop flag, waits for the main loop to observe it, then waits for every
    /// in-flight processor to finish. No new claims are issued once this returns.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(WorkerError::NotRunning);
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.main_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Acquiring every permit blocks until all in-flight processors have released theirs.
        let _ = self.slots.acquire_many(self.config.concurrency as u32).await;

        info!("worker stopped");
        Ok(())
    }
}

/// Drains whatever worker IDs are immediately available without blocking.
async fn drain_ready_ids(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut ids = Vec::new();
    while let Ok(id) = rx.try_recv() {
        ids.push(id);
    }
    ids
}

/// Blocks until at least one worker ID is free (or shutdown is signaled), then drains any
/// others that are immediately available too. Returns `None` only when the channel itself has
/// closed, which should not happen while `self` is alive.
async fn recv_available_ids(
    rx: &mut mpsc::Receiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Vec<String>> {
    tokio::select! {
        maybe_id = rx.recv() => {
            let mut ids = vec![maybe_id?];
            ids.extend(drain_ready_ids(rx).await);
            Some(ids)
        }
        _ = shutdown_rx.changed() => None,
    }
}

async fn claim_all(
    store: &Arc<dyn Store>,
    namespace_id: &str,
    lease_duration: Duration,
    worker_ids: Vec<String>,
) -> Vec<(String, Result<Option<WorkflowRun>, StoreError>)> {
    let lease_duration_ms = lease_duration.as_millis() as i64;
    let futures = worker_ids.into_iter().map(|worker_id| {
        let store = store.clone();
        let namespace_id = namespace_id.to_string();
        async move {
            let result = store
                .claim_workflow_run(ClaimParams {
                    namespace_id,
                    worker_id: worker_id.clone(),
                    lease_duration_ms,
                })
                .await;
            (worker_id, result)
        }
    });
    futures::future::join_all(futures).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_claim(
    store: &Arc<dyn Store>,
    namespace_id: &str,
    registry: &Arc<WorkflowRegistry>,
    load: &Arc<LoadState>,
    slots: &Arc<Semaphore>,
    free_ids_tx: &mpsc::Sender<String>,
    lease_duration: Duration,
    worker_id: String,
    result: Result<Option<WorkflowRun>, StoreError>,
) {
    let run = match result {
        Ok(Some(run)) => run,
        Ok(None) => {
            let _ = free_ids_tx.send(worker_id).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "claim failed");
            let _ = free_ids_tx.send(worker_id).await;
            return;
        }
    };

    let resolved = registry.resolve(&run.workflow_name, run.version.as_deref()).cloned();
    let Some(workflow) = resolved else {
        let store = store.clone();
        let free_ids_tx = free_ids_tx.clone();
        let worker_id_owned = worker_id.clone();
        tokio::spawn(async move {
            fail_unregistered(&store, &run, &worker_id_owned).await;
            let _ = free_ids_tx.send(worker_id_owned).await;
        });
        return;
    };

    let permit = match slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            // Shouldn't happen: a free worker ID implies a free slot. Defensive only.
            let _ = free_ids_tx.send(worker_id).await;
            return;
        }
    };

    load.slot_claimed();
    let store = store.clone();
    let free_ids_tx = free_ids_tx.clone();
    let load = load.clone();
    let namespace_id = namespace_id.to_string();
    let run_id = run.id.clone();
    let worker_id_for_heartbeat = worker_id.clone();

    tokio::spawn(async move {
        let (heartbeat_stop_tx, mut heartbeat_stop_rx) = watch::channel(false);
        let heartbeat_store = store.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease_duration / 2);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat_store
                            .extend_workflow_run_lease(
                                &namespace_id,
                                &run_id,
                                &worker_id_for_heartbeat,
                                lease_duration.as_millis() as i64,
                            )
                            .await
                        {
                            warn!(error = %e, run_id = %run_id, "heartbeat failed, will retry");
                        }
                    }
                    _ = heartbeat_stop_rx.changed() => break,
                }
            }
        });

        let processor = RunProcessor::new(store);
        if let Err(e) = processor.process(run, &workflow).await {
            error!(error = %e, "processor failed");
        }

        let _ = heartbeat_stop_tx.send(true);
        let _ = heartbeat_handle.await;

        drop(permit);
        load.slot_released();
        let _ = free_ids_tx.send(worker_id).await;
    });
}

async fn fail_unregistered(store: &Arc<dyn Store>, run: &WorkflowRun, worker_id: &str) {
    let error = JsonError::new(format!("unknown workflow type: {}", run.workflow_name));
    let retry_policy = RetryPolicy::no_retry();
    if let Err(e) = store
        .fail_workflow_run(crate::persistence::FailWorkflowRunParams {
            namespace_id: run.namespace_id.clone(),
            run_id: run.id.clone(),
            worker_id: worker_id.to_string(),
            error,
            retry_policy: &retry_policy,
        })
        .await
    {
        error!(error = %e, run_id = %run.id, "failed to fail unregistered-workflow run");
    }
}

async fn wait_or_shutdown(interval: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown_rx.changed() => true,
    }
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RegisteredWorkflow;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn echo_workflow() -> RegisteredWorkflow {
        RegisteredWorkflow {
            name: "echo".into(),
            version: None,
            retry_policy: RetryPolicy::default(),
            func: Arc::new(|input, _step, _version| Box::pin(async move { Ok(input) })),
        }
    }

    #[tokio::test]
    async fn tick_claims_and_runs_one_pending_workflow() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .create_workflow_run(crate::persistence::CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "echo".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: json!({}),
                context: None,
                input: Some(json!({"x": 1})),
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let mut registry = WorkflowRegistry::new();
        registry.insert(echo_workflow());

        let worker = Worker::new(store.clone(), "ns", registry, WorkerConfig::new());
        let claimed = worker.tick().await.unwrap();
        assert_eq!(claimed, 1);

        let page = store
            .list_workflow_runs(
                "ns",
                crate::persistence::WorkflowRunFilter::default(),
                crate::persistence::PageOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.data[0].status, crate::persistence::RunStatus::Completed);
    }

    #[tokio::test]
    async fn tick_fails_runs_with_no_registered_workflow() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .create_workflow_run(crate::persistence::CreateWorkflowRunParams {
                namespace_id: "ns".into(),
                workflow_name: "missing".into(),
                version: None,
                idempotency_key: None,
                concurrency_key: None,
                concurrency_limit: None,
                config: json!({}),
                context: None,
                input: None,
                available_at: None,
                deadline_at: None,
            })
            .await
            .unwrap();

        let worker = Worker::new(store.clone(), "ns", WorkflowRegistry::new(), WorkerConfig::new());
        let claimed = worker.tick().await.unwrap();
        assert_eq!(claimed, 1);

        let page = store
            .list_workflow_runs(
                "ns",
                crate::persistence::WorkflowRunFilter::default(),
                crate::persistence::PageOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.data[0].status, crate::persistence::RunStatus::Failed);
    }

    #[tokio::test]
    async fn start_and_stop_round_trip_without_work() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let worker = Worker::new(store, "ns", WorkflowRegistry::new(), WorkerConfig::new().with_poll_interval(Duration::from_millis(5)));
        worker.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.stop().await.unwrap();
    }
}
