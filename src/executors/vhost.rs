use async_trait::async_trait;
use serde_json::json;

use super::{backend_failure, payload_str, require_domain, ExecutorContext};
use crate::backend::VhostSpec;
use crate::constants::steps;
use crate::models::ProvisioningTask;
use crate::orchestration::step_executor::{StepExecutor, StepResult};

/// Creates the virtual host serving the subscription's domain
pub struct VhostExecutor {
    context: ExecutorContext,
}

impl VhostExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl StepExecutor for VhostExecutor {
    fn step_name(&self) -> &'static str {
        steps::CREATE_VHOST
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        let domain = match require_domain(task, steps::CREATE_VHOST) {
            Ok(domain) => domain,
            Err(result) => return result,
        };
        let server = match self.context.assigned_server(task, steps::CREATE_VHOST).await {
            Ok(server) => server,
            Err(result) => return result,
        };

        let spec = VhostSpec {
            subscription_id: task.subscription_id,
            document_root: payload_str(task, "vhost", "document_root")
                .map(str::to_string)
                .unwrap_or_else(|| format!("/var/www/{domain}/public")),
            php_version: payload_str(task, "vhost", "php_version").map(str::to_string),
            domain,
        };

        match self.context.backend.create_vhost(&server, &spec).await {
            Ok(handle) => StepResult::success(json!({
                "resource_id": handle.resource_id,
                "created": handle.created,
                "server_id": server.id,
                "hostname": server.hostname,
                "domain": spec.domain,
                "document_root": spec.document_root,
            })),
            Err(error) => backend_failure(steps::CREATE_VHOST, &error),
        }
    }
}
