//! The worker: a fixed-concurrency dispatcher that polls a [`Store`](crate::persistence::Store)
//! for claimable runs and drives each through the [`WorkflowRegistry`](crate::engine::WorkflowRegistry).
//!
//! - [`Worker`] — owns a pool of pre-allocated worker IDs and the claim/dispatch/heartbeat loop.
//! - [`WorkerConfig`] — concurrency, poll interval, lease duration.
//! - [`LoadState`] — slot accounting consulted by the claim loop.
//!
//! # Example
//!
//! ```ignore
//! use everruns_durable::worker::{Worker, WorkerConfig};
//!
//! let worker = Worker::new(store, "default", registry, WorkerConfig::new().with_concurrency(10));
//! worker.start().await?;
//! // ...
//! worker.stop().await?;
//! ```

mod backpressure;
mod poller;
mod pool;

pub use backpressure::LoadState;
pub use poller::PollerConfig;
pub use pool::{Worker, WorkerConfig, WorkerError};
