//! # Step Executor Interface
//!
//! One executor per step name. Executors are idempotent: running one twice for the
//! same task must leave the same resources behind, because a task resumes at its
//! persisted step after any retry or crash.
//!
//! Executors never return `Err`. Every outcome, including a failure, is a
//! [`StepResult`] which the task processor turns into a state transition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::models::ProvisioningTask;

/// Whether a failed step may succeed if run again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Outcome of one executor invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    /// Merged into the task payload's artifacts for downstream steps
    pub result_data: Option<Value>,
    /// The failure was caused by the assigned server; release it before retrying
    #[serde(default)]
    pub server_fault: bool,
}

impl StepResult {
    pub fn success(result_data: Value) -> Self {
        Self {
            success: true,
            error_kind: None,
            detail: None,
            result_data: Some(result_data),
            server_fault: false,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Transient, detail)
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::failure(ErrorKind::Permanent, detail)
    }

    pub fn failure(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            detail: Some(detail.into()),
            result_data: None,
            server_fault: false,
        }
    }

    pub fn with_server_fault(mut self) -> Self {
        self.server_fault = true;
        self
    }

    pub fn is_transient(&self) -> bool {
        !self.success && self.error_kind == Some(ErrorKind::Transient)
    }

    /// Message stored as the task's `error_message`
    pub fn error_message(&self) -> String {
        self.detail
            .clone()
            .unwrap_or_else(|| "step failed without detail".to_string())
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Step name this executor handles
    fn step_name(&self) -> &'static str;

    async fn execute(&self, task: &ProvisioningTask) -> StepResult;
}

/// Step name → executor lookup
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the executor's own step name, replacing any earlier one
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let name = executor.step_name().to_string();
        info!(step_name = %name, "Registering step executor");
        self.executors.insert(name, executor);
    }

    /// Register under an explicit name (tests, aliases)
    pub fn register_as(&mut self, step_name: &str, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_name.to_string(), executor);
    }

    pub fn get(&self, step_name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_name).cloned()
    }

    pub fn contains(&self, step_name: &str) -> bool {
        self.executors.contains_key(step_name)
    }

    pub fn step_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("steps", &self.step_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl StepExecutor for Noop {
        fn step_name(&self) -> &'static str {
            "noop"
        }

        async fn execute(&self, _task: &ProvisioningTask) -> StepResult {
            StepResult::success(json!({}))
        }
    }

    #[test]
    fn test_result_constructors() {
        let ok = StepResult::success(json!({"id": 1}));
        assert!(ok.success);
        assert!(!ok.is_transient());

        let flaky = StepResult::transient("timeout").with_server_fault();
        assert!(flaky.is_transient());
        assert!(flaky.server_fault);
        assert_eq!(flaky.error_message(), "timeout");

        let bad = StepResult::permanent("domain taken");
        assert_eq!(bad.error_kind, Some(ErrorKind::Permanent));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Noop));
        registry.register_as("alias", Arc::new(Noop));

        assert!(registry.contains("noop"));
        assert!(registry.get("alias").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.step_names(), vec!["alias", "noop"]);
    }
}
