use async_trait::async_trait;
use serde_json::json;

use super::{backend_failure, payload_i64, payload_str, ExecutorContext};
use crate::backend::DatabaseSpec;
use crate::constants::steps;
use crate::models::ProvisioningTask;
use crate::orchestration::step_executor::{StepExecutor, StepResult};

/// Creates the subscription's database and its owning user
pub struct DatabaseExecutor {
    context: ExecutorContext,
}

impl DatabaseExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    /// Name from `payload.database.name`, else derived from the subscription id
    fn database_name(task: &ProvisioningTask) -> String {
        payload_str(task, "database", "name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("sub{}_db", task.subscription_id))
    }
}

#[async_trait]
impl StepExecutor for DatabaseExecutor {
    fn step_name(&self) -> &'static str {
        steps::CREATE_DATABASE
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        let server = match self.context.assigned_server(task, steps::CREATE_DATABASE).await {
            Ok(server) => server,
            Err(result) => return result,
        };

        let name = Self::database_name(task);
        let spec = DatabaseSpec {
            subscription_id: task.subscription_id,
            user: payload_str(task, "database", "user")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{name}_user")),
            quota_mb: payload_i64(task, "sizing", "database_mb"),
            name,
        };

        match self.context.backend.create_database(&server, &spec).await {
            Ok(handle) => StepResult::success(json!({
                "resource_id": handle.resource_id,
                "created": handle.created,
                "server_id": server.id,
                "name": spec.name,
                "user": spec.user,
            })),
            Err(error) => backend_failure(steps::CREATE_DATABASE, &error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{fixture, task};

    #[tokio::test]
    async fn test_default_names_derive_from_subscription() {
        let fx = fixture().await;
        let executor = DatabaseExecutor::new(fx.context.clone());
        let result = executor.execute(&task(42, Some(fx.server.id), json!({}))).await;

        let data = result.result_data.unwrap();
        assert_eq!(data["name"], "sub42_db");
        assert_eq!(data["user"], "sub42_db_user");
        assert!(fx.backend.has_database("sub42_db"));
    }

    #[tokio::test]
    async fn test_rerun_reuses_database() {
        let fx = fixture().await;
        let executor = DatabaseExecutor::new(fx.context.clone());
        let payload = json!({"database": {"name": "shop"}});
        executor.execute(&task(1, Some(fx.server.id), payload.clone())).await;
        let again = executor.execute(&task(1, Some(fx.server.id), payload)).await;

        assert!(again.success);
        assert_eq!(again.result_data.unwrap()["created"], false);
    }

    #[tokio::test]
    async fn test_unallocated_task_is_transient_server_fault() {
        let fx = fixture().await;
        let executor = DatabaseExecutor::new(fx.context.clone());
        let result = executor.execute(&task(1, None, json!({}))).await;
        assert!(result.is_transient());
        assert!(result.server_fault);
    }
}
