//! Persistence: the [`Store`] trait and its two implementations.
//!
//! - [`InMemoryStore`] — single-process, `parking_lot`-guarded, for tests.
//! - [`PostgresStore`] — the production backend, `SELECT ... FOR UPDATE SKIP LOCKED` claims.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    ClaimParams, CreateStepAttemptParams, CreateWorkflowRunParams, Cursor, FailWorkflowRunParams,
    JsonError, Page, PageOptions, RescheduleParams, RunStatus, SleepContext, Store, StoreError,
    StepAttempt, StepKind, StepStatus, Timestamp, WorkflowRun, WorkflowRunFilter,
};
