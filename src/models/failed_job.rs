use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProvisioningTask;

/// Dead-letter view over a task that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobRecord {
    pub task_id: i64,
    pub subscription_id: i64,
    pub step: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub server_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl From<&ProvisioningTask> for FailedJobRecord {
    fn from(task: &ProvisioningTask) -> Self {
        Self {
            task_id: task.id,
            subscription_id: task.subscription_id,
            step: task.step.clone(),
            attempts: task.attempts,
            max_retries: task.max_retries,
            error_message: task.error_message.clone(),
            server_id: task.server_id,
            created_at: task.created_at,
            failed_at: task.updated_at,
        }
    }
}
