use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskStatus,
};
use crate::constants::messages;
use crate::models::{ProvisioningTask, TaskUpdate};

/// Pure transition logic for provisioning tasks.
///
/// `apply` never touches storage: it validates the event against the task's current
/// state and returns the full [`TaskUpdate`] the caller persists with an optimistic
/// version check.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        let target = match (current_state, event) {
            // Claiming
            (TaskStatus::Pending, TaskEvent::Claim { .. }) => TaskStatus::Processing,

            // Progress within the step sequence
            (TaskStatus::Processing, TaskEvent::AdvanceStep { .. }) => TaskStatus::Processing,
            (TaskStatus::Processing, TaskEvent::Complete { .. }) => TaskStatus::Success,

            // Failure handling
            (TaskStatus::Processing, TaskEvent::RetryLater { .. }) => TaskStatus::Pending,
            (TaskStatus::Processing, TaskEvent::Fail { .. }) => TaskStatus::Failed,
            (TaskStatus::Pending | TaskStatus::Processing, TaskEvent::Cancel) => {
                TaskStatus::Failed
            }

            // Recovery
            (TaskStatus::Processing, TaskEvent::RecoverStale) => TaskStatus::Pending,
            (TaskStatus::Failed, TaskEvent::ManualRetry) => TaskStatus::Pending,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Validate `event` against `task` and compute the resulting field values
    pub fn apply(task: &ProvisioningTask, event: &TaskEvent) -> StateMachineResult<TaskUpdate> {
        let target = Self::determine_target_state(task.status, event)?;
        Self::check_guards(task, event)?;

        let mut update = TaskUpdate::from(task);
        update.status = target;
        update.backoff = None;

        match event {
            TaskEvent::Claim { worker_id } => {
                update.attempts += 1;
                update.claimed_by = Some(worker_id.clone());
            }
            TaskEvent::AdvanceStep {
                completed_step,
                next_step,
                result_data,
            } => {
                if let Some(data) = result_data {
                    update.record_artifact(completed_step, data.clone());
                }
                update.step = Some(next_step.clone());
            }
            TaskEvent::Complete {
                completed_step,
                result_data,
            } => {
                if let Some(data) = result_data {
                    update.record_artifact(completed_step, data.clone());
                }
                update.step = Some(completed_step.clone());
                update.error_message = None;
                update.claimed_by = None;
            }
            TaskEvent::RetryLater {
                error,
                delay,
                release_server,
            } => {
                update.error_message = Some(error.clone());
                update.backoff = Some(*delay);
                update.claimed_by = None;
                if *release_server {
                    update.server_id = None;
                }
            }
            TaskEvent::Fail { error } => {
                update.error_message = Some(error.clone());
                update.claimed_by = None;
            }
            TaskEvent::Cancel => {
                update.error_message = Some(messages::CANCELLED.to_string());
                update.claimed_by = None;
            }
            TaskEvent::ManualRetry => {
                update.attempts = 0;
                update.error_message = None;
                update.claimed_by = None;
            }
            TaskEvent::RecoverStale => {
                update.claimed_by = None;
            }
        }

        Ok(update)
    }

    /// Check guard conditions for the transition
    fn check_guards(task: &ProvisioningTask, event: &TaskEvent) -> StateMachineResult<()> {
        match event {
            TaskEvent::RetryLater { .. } if task.retries_exhausted() => {
                Err(StateMachineError::GuardFailed(format!(
                    "Task {} has used {} of {} attempts and cannot be retried automatically",
                    task.id, task.attempts, task.max_retries
                )))
            }
            TaskEvent::ManualRetry if task.cleared_at.is_some() => {
                Err(StateMachineError::GuardFailed(format!(
                    "Task {} was cleared from the dead-letter list",
                    task.id
                )))
            }
            TaskEvent::AdvanceStep { next_step, .. } if next_step.is_empty() => Err(
                StateMachineError::GuardFailed("Next step name must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn task_in(status: TaskStatus, attempts: i32) -> ProvisioningTask {
        let now = Utc::now();
        ProvisioningTask {
            id: 7,
            subscription_id: 70,
            status,
            step: Some("create_vhost".to_string()),
            attempts,
            max_retries: 3,
            payload: json!({"domain": "example.org"}),
            error_message: None,
            server_id: Some(2),
            version: 4,
            backoff_until: None,
            claimed_by: Some("worker-1".to_string()),
            cleared_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            TaskStateMachine::determine_target_state(
                TaskStatus::Pending,
                &TaskEvent::Claim {
                    worker_id: "w".to_string()
                }
            )
            .unwrap(),
            TaskStatus::Processing
        );
        assert_eq!(
            TaskStateMachine::determine_target_state(
                TaskStatus::Failed,
                &TaskEvent::ManualRetry
            )
            .unwrap(),
            TaskStatus::Pending
        );
        assert_eq!(
            TaskStateMachine::determine_target_state(
                TaskStatus::Processing,
                &TaskEvent::fail_with_error("boom")
            )
            .unwrap(),
            TaskStatus::Failed
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(TaskStateMachine::determine_target_state(
            TaskStatus::Success,
            &TaskEvent::ManualRetry
        )
        .is_err());
        assert!(TaskStateMachine::determine_target_state(
            TaskStatus::Pending,
            &TaskEvent::Complete {
                completed_step: "create_vhost".to_string(),
                result_data: None
            }
        )
        .is_err());
        assert!(TaskStateMachine::determine_target_state(
            TaskStatus::Failed,
            &TaskEvent::Claim {
                worker_id: "w".to_string()
            }
        )
        .is_err());
    }

    #[test]
    fn test_claim_increments_attempts() {
        let task = task_in(TaskStatus::Pending, 1);
        let update = TaskStateMachine::apply(
            &task,
            &TaskEvent::Claim {
                worker_id: "worker-9".to_string(),
            },
        )
        .unwrap();
        assert_eq!(update.attempts, 2);
        assert_eq!(update.claimed_by.as_deref(), Some("worker-9"));
    }

    #[test]
    fn test_retry_later_sets_backoff_and_optionally_drops_server() {
        let task = task_in(TaskStatus::Processing, 1);
        let keep = TaskStateMachine::apply(
            &task,
            &TaskEvent::RetryLater {
                error: "timeout".to_string(),
                delay: Duration::from_secs(10),
                release_server: false,
            },
        )
        .unwrap();
        assert_eq!(keep.status, TaskStatus::Pending);
        assert_eq!(keep.backoff, Some(Duration::from_secs(10)));
        assert_eq!(keep.server_id, Some(2));

        let released = TaskStateMachine::apply(
            &task,
            &TaskEvent::RetryLater {
                error: "server unreachable".to_string(),
                delay: Duration::from_secs(10),
                release_server: true,
            },
        )
        .unwrap();
        assert_eq!(released.server_id, None);
    }

    #[test]
    fn test_retry_later_rejected_when_attempts_exhausted() {
        let task = task_in(TaskStatus::Processing, 3);
        let result = TaskStateMachine::apply(
            &task,
            &TaskEvent::RetryLater {
                error: "timeout".to_string(),
                delay: Duration::from_secs(10),
                release_server: false,
            },
        );
        assert!(matches!(result, Err(StateMachineError::GuardFailed(_))));
    }

    #[test]
    fn test_manual_retry_resets_attempts_unless_cleared() {
        let mut task = task_in(TaskStatus::Failed, 3);
        task.error_message = Some("rate limited".to_string());
        let update = TaskStateMachine::apply(&task, &TaskEvent::ManualRetry).unwrap();
        assert_eq!(update.attempts, 0);
        assert_eq!(update.error_message, None);
        assert_eq!(update.step.as_deref(), Some("create_vhost"));

        task.cleared_at = Some(Utc::now());
        assert!(TaskStateMachine::apply(&task, &TaskEvent::ManualRetry).is_err());
    }

    #[test]
    fn test_advance_records_artifact_and_moves_step() {
        let task = task_in(TaskStatus::Processing, 1);
        let update = TaskStateMachine::apply(
            &task,
            &TaskEvent::AdvanceStep {
                completed_step: "create_vhost".to_string(),
                next_step: "issue_certificate".to_string(),
                result_data: Some(json!({"document_root": "/srv/example.org"})),
            },
        )
        .unwrap();
        assert_eq!(update.step.as_deref(), Some("issue_certificate"));
        assert_eq!(
            update.payload["artifacts"]["create_vhost"]["document_root"],
            "/srv/example.org"
        );
    }

    #[test]
    fn test_cancel_sets_cancelled_message() {
        let task = task_in(TaskStatus::Processing, 1);
        let update = TaskStateMachine::apply(&task, &TaskEvent::Cancel).unwrap();
        assert_eq!(update.status, TaskStatus::Failed);
        assert_eq!(update.error_message.as_deref(), Some("cancelled"));
    }
}
