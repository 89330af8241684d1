use async_trait::async_trait;
use serde_json::json;

use super::{backend_failure, payload_i64, payload_str, ExecutorContext};
use crate::backend::MailboxSpec;
use crate::constants::steps;
use crate::models::ProvisioningTask;
use crate::orchestration::step_executor::{StepExecutor, StepResult};

/// Creates the subscription's first mailbox on the central mail platform
pub struct MailboxExecutor {
    context: ExecutorContext,
}

impl MailboxExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl StepExecutor for MailboxExecutor {
    fn step_name(&self) -> &'static str {
        steps::CREATE_MAILBOX
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        let address = match (payload_str(task, "mailbox", "address"), task.domain()) {
            (Some(address), _) => address.to_string(),
            (None, Some(domain)) => format!("admin@{domain}"),
            (None, None) => {
                return StepResult::permanent(format!(
                    "{}: payload has neither mailbox.address nor domain",
                    steps::CREATE_MAILBOX
                ))
            }
        };

        let spec = MailboxSpec {
            subscription_id: task.subscription_id,
            address,
            quota_mb: payload_i64(task, "sizing", "mailbox_mb"),
        };

        match self.context.backend.create_mailbox(&spec).await {
            Ok(handle) => StepResult::success(json!({
                "resource_id": handle.resource_id,
                "created": handle.created,
                "address": spec.address,
            })),
            Err(error) => backend_failure(steps::CREATE_MAILBOX, &error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{fixture, task};
    use crate::orchestration::step_executor::ErrorKind;

    #[tokio::test]
    async fn test_address_defaults_to_admin_at_domain() {
        let fx = fixture().await;
        let executor = MailboxExecutor::new(fx.context.clone());
        let result = executor.execute(&task(1, None, json!({"domain": "mail.test"}))).await;

        assert!(result.success);
        assert!(fx.backend.has_mailbox("admin@mail.test"));
    }

    #[tokio::test]
    async fn test_malformed_address_is_permanent() {
        let fx = fixture().await;
        let executor = MailboxExecutor::new(fx.context.clone());
        let result = executor
            .execute(&task(1, None, json!({"mailbox": {"address": "nobody"}})))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    }
}
