//! Property-based tests for the task state machine, the one-active-task rule,
//! server selection and step plans.

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

use provisioner::models::{ProvisioningTask, Server, ServerStatus};
use provisioner::orchestration::{ServerAllocator, StepPlan};
use provisioner::state_machine::{TaskEvent, TaskStateMachine};
use provisioner::store::{InMemoryStore, TaskStore};
use provisioner::{ProvisionerError, TaskStatus};

fn fresh_task() -> ProvisioningTask {
    let now = Utc::now();
    ProvisioningTask {
        id: 1,
        subscription_id: 1,
        status: TaskStatus::Pending,
        step: None,
        attempts: 0,
        max_retries: 3,
        payload: json!({"domain": "prop.test"}),
        error_message: None,
        server_id: None,
        version: 1,
        backoff_until: None,
        claimed_by: None,
        cleared_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn event_strategy() -> impl Strategy<Value = TaskEvent> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|worker_id| TaskEvent::Claim { worker_id }),
        ("[a-z_]{1,12}", "[a-z_]{1,12}").prop_map(|(completed_step, next_step)| {
            TaskEvent::AdvanceStep {
                completed_step,
                next_step,
                result_data: Some(json!({"ok": true})),
            }
        }),
        "[a-z_]{1,12}".prop_map(|completed_step| TaskEvent::Complete {
            completed_step,
            result_data: None,
        }),
        (0u64..600, any::<bool>()).prop_map(|(secs, release_server)| TaskEvent::RetryLater {
            error: "transient".to_string(),
            delay: Duration::from_secs(secs),
            release_server,
        }),
        Just(TaskEvent::fail_with_error("permanent")),
        Just(TaskEvent::Cancel),
        Just(TaskEvent::ManualRetry),
        Just(TaskEvent::RecoverStale),
    ]
}

/// Write an accepted update back the way the store does
fn write(task: &mut ProvisioningTask, event: &TaskEvent) -> bool {
    match TaskStateMachine::apply(task, event) {
        Ok(update) => {
            task.status = update.status;
            task.step = update.step;
            task.error_message = update.error_message;
            task.attempts = update.attempts;
            task.payload = update.payload;
            task.server_id = update.server_id;
            task.claimed_by = update.claimed_by;
            task.version += 1;
            true
        }
        Err(_) => false,
    }
}

fn server_strategy() -> impl Strategy<Value = Vec<Server>> {
    prop::collection::vec((0i32..20, 0i32..20, any::<bool>()), 0..8).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (max, used, active))| Server {
                id: i as i64 + 1,
                name: format!("web-{i:02}"),
                hostname: format!("web-{i:02}.fleet"),
                control_panel_kind: "simulated".to_string(),
                max_accounts: max,
                current_accounts: used.min(max),
                status: if active {
                    ServerStatus::Active
                } else {
                    ServerStatus::Inactive
                },
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_claim_owner_present_only_while_processing(
        events in prop::collection::vec(event_strategy(), 1..40)
    ) {
        let mut task = fresh_task();
        for event in &events {
            write(&mut task, event);
            prop_assert_eq!(
                task.claimed_by.is_some(),
                task.status == TaskStatus::Processing,
                "after {:?}", event
            );
        }
    }

    #[test]
    fn prop_success_is_final(events in prop::collection::vec(event_strategy(), 1..40)) {
        let mut task = fresh_task();
        let mut succeeded = false;
        for event in &events {
            let accepted = write(&mut task, event);
            if succeeded {
                prop_assert!(!accepted, "{:?} accepted after success", event);
                prop_assert_eq!(task.status, TaskStatus::Success);
            }
            if task.status == TaskStatus::Success {
                succeeded = true;
                prop_assert!(task.error_message.is_none());
            }
        }
    }

    #[test]
    fn prop_failed_only_reopens_by_manual_retry(
        events in prop::collection::vec(event_strategy(), 1..40)
    ) {
        let mut task = fresh_task();
        for event in &events {
            let before = task.status;
            let accepted = write(&mut task, event);
            if before == TaskStatus::Failed && accepted {
                prop_assert_eq!(event, &TaskEvent::ManualRetry);
                prop_assert_eq!(task.status, TaskStatus::Pending);
                prop_assert_eq!(task.attempts, 0);
            }
        }
    }

    #[test]
    fn prop_retry_later_requires_attempts_left(attempts in 0i32..6, max_retries in 1i32..5) {
        let mut task = fresh_task();
        task.status = TaskStatus::Processing;
        task.claimed_by = Some("w".to_string());
        task.attempts = attempts;
        task.max_retries = max_retries;

        let result = TaskStateMachine::apply(&task, &TaskEvent::RetryLater {
            error: "busy".to_string(),
            delay: Duration::from_secs(10),
            release_server: false,
        });
        prop_assert_eq!(result.is_ok(), attempts < max_retries);
    }

    #[test]
    fn prop_selection_picks_least_loaded_with_capacity(servers in server_strategy()) {
        let chosen = ServerAllocator::select(&servers);
        let candidates: Vec<&Server> = servers.iter().filter(|s| s.has_capacity()).collect();

        match chosen {
            None => prop_assert!(candidates.is_empty()),
            Some(server) => {
                prop_assert!(server.has_capacity());
                for other in candidates {
                    prop_assert!(server.load_ratio() <= other.load_ratio());
                }
            }
        }
    }

    #[test]
    fn prop_website_plan_shape(database in any::<bool>(), mailbox in any::<bool>()) {
        let mut features = Vec::new();
        if database {
            features.push("database");
        }
        if mailbox {
            features.push("mailbox");
        }
        let plan = StepPlan::from_payload(&json!({"features": features})).unwrap();
        let steps = plan.steps();

        prop_assert_eq!(steps.first().map(String::as_str), Some("allocate_server"));
        prop_assert_eq!(steps.last().map(String::as_str), Some("schedule_backup"));
        prop_assert_eq!(steps.len(), 4 + usize::from(database) + usize::from(mailbox));
        for (index, step) in steps.iter().enumerate() {
            prop_assert_eq!(plan.resume_index(Some(step)).unwrap(), index);
        }
    }

    #[test]
    fn prop_one_active_task_per_subscription(
        actions in prop::collection::vec((0i64..4, any::<bool>()), 1..30)
    ) {
        tokio_test::block_on(async {
            let store = InMemoryStore::new();
            for (subscription_id, finish_first) in actions {
                if finish_first {
                    // Close out whatever is active so a new task may open
                    if let Some(active) = store.find_active_for_subscription(subscription_id).await.unwrap() {
                        let update = TaskStateMachine::apply(&active, &TaskEvent::Cancel).unwrap();
                        store.update_status(active.id, active.version, update).await.unwrap();
                    }
                }

                let had_active = store
                    .find_active_for_subscription(subscription_id)
                    .await
                    .unwrap()
                    .is_some();
                let created = store.create(subscription_id, json!({}), 3).await;
                match created {
                    Ok(_) => prop_assert!(!had_active),
                    Err(ProvisionerError::DuplicateActiveTask { .. }) => prop_assert!(had_active),
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }

                let active = store
                    .list_by_status(None, None)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|t| t.subscription_id == subscription_id && !t.is_terminal())
                    .count();
                prop_assert_eq!(active, 1);
            }
            Ok(())
        })?;
    }
}
