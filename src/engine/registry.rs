//! Worker-side registry mapping a claimed run's `workflowName` (+ optional `version`) to the
//! user function that drives it.
//!
//! The registry is type-erased over `serde_json::Value`: the worker never needs the concrete
//! `Input`/`Output` types of a registered workflow, only its name, its optional retry policy,
//! and a closure it can invoke with JSON in, JSON out.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::engine::executor::ExecutorSignal;
use crate::engine::StepExecutor;
use crate::reliability::RetryPolicy;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A type-erased workflow body: `(input, step, version) -> output`, JSON in and out.
pub type WorkflowFn = Arc<
    dyn Fn(Value, Arc<StepExecutor>, Option<String>) -> BoxFuture<Result<Value, ExecutorSignal>>
        + Send
        + Sync,
>;

/// One registered workflow: its dispatch function plus the retry policy the run processor
/// consults when the function returns an ordinary error.
#[derive(Clone)]
pub struct RegisteredWorkflow {
    pub name: String,
    pub version: Option<String>,
    pub retry_policy: RetryPolicy,
    pub func: WorkflowFn,
}

/// Maps `workflowName` to the function that can execute it, consulted by the worker on
/// every successful claim.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    entries: HashMap<String, RegisteredWorkflow>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn insert(&mut self, workflow: RegisteredWorkflow) {
        self.entries.insert(workflow.name.clone(), workflow);
    }

    /// Looks up a workflow by name, honoring an optional version pin: a registration with a
    /// `version` only answers claims carrying that exact version; a versionless registration
    /// answers any claim.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<&RegisteredWorkflow> {
        let entry = self.entries.get(name)?;
        match (&entry.version, version) {
            (Some(registered), Some(claimed)) if registered != claimed => None,
            _ => Some(entry),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry resolution, surfaced by the worker when a claimed run names a
/// workflow it has no registration for.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_workflow(name: &str, version: Option<&str>) -> RegisteredWorkflow {
        RegisteredWorkflow {
            name: name.to_string(),
            version: version.map(|v| v.to_string()),
            retry_policy: RetryPolicy::default(),
            func: Arc::new(|input, _step, _version| Box::pin(async move { Ok(input) })),
        }
    }

    #[test]
    fn resolves_versionless_registration_for_any_claim() {
        let mut registry = WorkflowRegistry::new();
        registry.insert(noop_workflow("greet", None));

        assert!(registry.resolve("greet", None).is_some());
        assert!(registry.resolve("greet", Some("v2")).is_some());
        assert!(registry.resolve("unknown", None).is_none());
    }

    #[test]
    fn versioned_registration_only_answers_matching_claims() {
        let mut registry = WorkflowRegistry::new();
        registry.insert(noop_workflow("greet", Some("v1")));

        assert!(registry.resolve("greet", Some("v1")).is_some());
        assert!(registry.resolve("greet", Some("v2")).is_none());
        // a claim with no explicit version is still answered by a versioned registration
        assert!(registry.resolve("greet", None).is_some());
    }
}
