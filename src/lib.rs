//! # Durable Execution Engine
//!
//! A library + worker pair for running application workflows as ordinary functions over
//! named, memoized steps: every step outcome is persisted so execution resumes exactly from
//! the last completed step across crashes, deployments, timeouts, and arbitrary-duration
//! sleeps.
//!
//! ## Features
//!
//! - **Durable step memoization**: replay reproduces prior step outputs without re-invoking
//!   their bodies, enforced by a determinism check on step ordering
//! - **Exponential-backoff retries**: a pure, exhaustively-tested retry decision function
//! - **Per-bucket concurrency limits**: cap concurrently-leased runs within a named bucket
//! - **Idempotent submission**: a repeated `idempotencyKey` within the lookback window returns
//!   the existing run instead of creating a duplicate
//! - **Two Store backends**: [`persistence::PostgresStore`] for production,
//!   [`persistence::InMemoryStore`] for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Workflow / Handle                    │
//! │   (client.rs -- typed submission, polling for a result)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Store                              │
//! │   (workflow_runs, step_attempts -- atomic claim/lease/retry) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Worker                              │
//! │  (claims runs, drives RunProcessor, heartbeats leases)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 RunProcessor + StepExecutor                  │
//! │  (replays history, memoizes steps, detects non-determinism) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use everruns_durable::prelude::*;
//!
//! async fn run() -> anyhow::Result<()> {
//!     let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
//!
//!     let definition = WorkflowDefinition::<String, String>::new(
//!         "greet",
//!         Arc::new(|input, _step| Box::pin(async move { Ok(format!("hi {input}")) })),
//!     );
//!     let workflow = Workflow::new(store.clone(), "default", definition);
//!
//!     let mut registry = WorkflowRegistry::new();
//!     registry.insert(workflow.registered());
//!     let worker = Worker::new(store, "default", registry, WorkerConfig::new());
//!
//!     let handle = workflow.run("world".to_string(), RunOptions::new()).await?;
//!     worker.tick().await?;
//!     assert_eq!(handle.result().await?, "hi world");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::client::{Handle, ClientError, RunOptions, Workflow, WorkflowDefinition};
    pub use crate::engine::{ExecutorSignal, RegisteredWorkflow, StepExecutor, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryStore, JsonError, PostgresStore, RunStatus, Store, StoreError, WorkflowRun,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
}

// Re-export key types at crate root.
pub use client::{Handle, ClientError, RunOptions, Workflow, WorkflowDefinition};
pub use engine::{ExecutorSignal, RegisteredWorkflow, RunProcessor, StepExecutor, WorkflowRegistry};
pub use persistence::{InMemoryStore, PostgresStore, Store, StoreError, WorkflowRun};
pub use reliability::RetryPolicy;
pub use worker::{Worker, WorkerConfig, WorkerError};
