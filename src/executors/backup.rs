use async_trait::async_trait;
use serde_json::{json, Value};

use super::{backend_failure, payload_str, ExecutorContext};
use crate::backend::BackupSpec;
use crate::constants::steps;
use crate::models::ProvisioningTask;
use crate::orchestration::step_executor::{StepExecutor, StepResult};

/// Registers the nightly backup job for the subscription's account
pub struct BackupScheduleExecutor {
    context: ExecutorContext,
    default_cron: String,
    default_retention_days: u32,
}

impl BackupScheduleExecutor {
    pub fn new(context: ExecutorContext, default_cron: &str, default_retention_days: u32) -> Self {
        Self {
            context,
            default_cron: default_cron.to_string(),
            default_retention_days,
        }
    }

    fn retention_days(&self, task: &ProvisioningTask) -> Result<u32, StepResult> {
        match task.payload.get("backup").and_then(|b| b.get("retention_days")) {
            None | Some(Value::Null) => Ok(self.default_retention_days),
            Some(value) => value
                .as_u64()
                .and_then(|days| u32::try_from(days).ok())
                .filter(|days| *days > 0)
                .ok_or_else(|| {
                    StepResult::permanent(format!(
                        "{}: backup.retention_days must be a positive integer, got {value}",
                        steps::SCHEDULE_BACKUP
                    ))
                }),
        }
    }
}

#[async_trait]
impl StepExecutor for BackupScheduleExecutor {
    fn step_name(&self) -> &'static str {
        steps::SCHEDULE_BACKUP
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        let retention_days = match self.retention_days(task) {
            Ok(days) => days,
            Err(result) => return result,
        };
        let server = match self.context.assigned_server(task, steps::SCHEDULE_BACKUP).await {
            Ok(server) => server,
            Err(result) => return result,
        };

        let spec = BackupSpec {
            subscription_id: task.subscription_id,
            cron: payload_str(task, "backup", "cron")
                .unwrap_or(&self.default_cron)
                .to_string(),
            retention_days,
        };

        match self.context.backend.schedule_backup(&server, &spec).await {
            Ok(handle) => StepResult::success(json!({
                "resource_id": handle.resource_id,
                "created": handle.created,
                "cron": spec.cron,
                "retention_days": spec.retention_days,
            })),
            Err(error) => backend_failure(steps::SCHEDULE_BACKUP, &error),
        }
    }
}
