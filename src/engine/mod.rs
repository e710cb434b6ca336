//! The deterministic replay engine: [`StepExecutor`] drives one claimed run's user function,
//! [`WorkflowRegistry`] resolves a claimed run's `workflowName` to the registered function.

mod executor;
mod processor;
mod registry;

pub use executor::{ExecutorSignal, StepConfig, StepExecutor};
pub use processor::{ProcessorError, RunProcessor};
pub use registry::{RegisteredWorkflow, RegistryError, WorkflowFn, WorkflowRegistry};
