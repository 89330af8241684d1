//! # Built-in Step Executors
//!
//! One executor per resource kind, each talking to the fleet through a
//! [`HostingBackend`]. All of them:
//!
//! - read their inputs from the task payload (and earlier steps' artifacts),
//! - map backend failures through the error classifier,
//! - return result data that is merged into the payload's artifacts.

pub mod backup;
pub mod certificate;
pub mod database;
pub mod mailbox;
pub mod vhost;

use serde_json::Value;
use std::sync::Arc;

use crate::backend::{BackendError, HostingBackend};
use crate::constants::system;
use crate::models::{ProvisioningTask, Server};
use crate::orchestration::error_classifier::{classify_backend_error, classify_provisioner_error};
use crate::orchestration::step_executor::{ExecutorRegistry, StepResult};
use crate::store::ServerRegistry;

pub use backup::BackupScheduleExecutor;
pub use certificate::CertificateExecutor;
pub use database::DatabaseExecutor;
pub use mailbox::MailboxExecutor;
pub use vhost::VhostExecutor;

/// Shared dependencies of the built-in executors
#[derive(Clone)]
pub struct ExecutorContext {
    pub backend: Arc<dyn HostingBackend>,
    pub servers: Arc<dyn ServerRegistry>,
}

impl ExecutorContext {
    pub fn new(backend: Arc<dyn HostingBackend>, servers: Arc<dyn ServerRegistry>) -> Self {
        Self { backend, servers }
    }

    /// The server the allocator assigned to `task`
    pub(crate) async fn assigned_server(
        &self,
        task: &ProvisioningTask,
        step_name: &str,
    ) -> Result<Server, StepResult> {
        let Some(server_id) = task.server_id else {
            return Err(StepResult::transient(format!(
                "{step_name}: no server allocated"
            ))
            .with_server_fault());
        };
        self.servers
            .get_server(server_id)
            .await
            .map_err(|e| classify_provisioner_error(&e).into_step_result(step_name))
    }
}

/// Registry holding every built-in executor
pub fn builtin_registry(context: ExecutorContext) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(VhostExecutor::new(context.clone())));
    registry.register(Arc::new(DatabaseExecutor::new(context.clone())));
    registry.register(Arc::new(MailboxExecutor::new(context.clone())));
    registry.register(Arc::new(CertificateExecutor::new(context.clone())));
    registry.register(Arc::new(BackupScheduleExecutor::new(
        context,
        system::DEFAULT_BACKUP_CRON,
        system::DEFAULT_BACKUP_RETENTION_DAYS,
    )));
    registry
}

pub(crate) fn backend_failure(step_name: &str, error: &BackendError) -> StepResult {
    classify_backend_error(error).into_step_result(step_name)
}

/// Required domain for domain-bound steps
pub(crate) fn require_domain(task: &ProvisioningTask, step_name: &str) -> Result<String, StepResult> {
    task.domain()
        .filter(|d| !d.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| StepResult::permanent(format!("{step_name}: payload has no domain")))
}

/// Look up `payload.<section>.<key>` as a string
pub(crate) fn payload_str<'a>(task: &'a ProvisioningTask, section: &str, key: &str) -> Option<&'a str> {
    task.payload
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(Value::as_str)
}

pub(crate) fn payload_i64(task: &ProvisioningTask, section: &str, key: &str) -> Option<i64> {
    task.payload
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(Value::as_i64)
}
