//! # Dead-Letter Tracker
//!
//! Failed tasks that used every attempt stay visible until an operator clears
//! them. Clearing is final: the task leaves the list, can no longer be retried,
//! gives back any server slot it still holds, and billing marks the
//! subscription `failed`.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::billing::SubscriptionGateway;
use crate::constants::{actors, events};
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::models::{FailedJobRecord, NewTaskTransition, ProvisioningTask, SubscriptionStatus, TaskUpdate};
use crate::store::TaskStore;

use super::server_allocator::ServerAllocator;

pub struct DeadLetterTracker {
    store: Arc<dyn TaskStore>,
    allocator: Arc<ServerAllocator>,
    billing: Arc<dyn SubscriptionGateway>,
}

impl DeadLetterTracker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        allocator: Arc<ServerAllocator>,
        billing: Arc<dyn SubscriptionGateway>,
    ) -> Self {
        Self {
            store,
            allocator,
            billing,
        }
    }

    pub async fn list(&self) -> ProvisionerResult<Vec<FailedJobRecord>> {
        let tasks = self.store.list_dead_letters().await?;
        Ok(tasks.iter().map(FailedJobRecord::from).collect())
    }

    /// Clear one dead-lettered task, or all of them when `task_id` is `None`.
    ///
    /// Returns the records that were cleared.
    #[instrument(skip(self))]
    pub async fn clear(&self, task_id: Option<i64>) -> ProvisionerResult<Vec<FailedJobRecord>> {
        let targets = match task_id {
            Some(id) => {
                let task = self.store.get(id).await?;
                let listed = self
                    .store
                    .list_dead_letters()
                    .await?
                    .iter()
                    .any(|t| t.id == id);
                if !listed {
                    return Err(ProvisionerError::ValidationError(format!(
                        "Task {id} is not in the failed job list"
                    )));
                }
                vec![task]
            }
            None => self.store.list_dead_letters().await?,
        };

        let mut cleared = Vec::with_capacity(targets.len());
        for task in targets {
            let record = FailedJobRecord::from(&task);
            self.clear_one(task).await?;
            cleared.push(record);
        }

        info!(count = cleared.len(), "Cleared failed jobs");
        Ok(cleared)
    }

    async fn clear_one(&self, task: ProvisioningTask) -> ProvisionerResult<()> {
        let mut written = self.store.mark_cleared(task.id, task.version).await?;

        let released = written.server_id;
        if let Some(server_id) = released {
            let mut update = TaskUpdate::from(&written);
            update.server_id = None;
            written = self
                .store
                .update_status(written.id, written.version, update)
                .await?;
            self.allocator.release(server_id, Some(written.id)).await?;
        }

        if let Err(e) = self
            .billing
            .set_status(written.subscription_id, SubscriptionStatus::Failed)
            .await
        {
            warn!(
                subscription_id = written.subscription_id,
                error = %e,
                "Could not mark subscription failed"
            );
        }

        let mut transition = NewTaskTransition::new(
            written.id,
            Some(written.status),
            written.status,
            events::TASK_CLEARED,
            actors::ADMIN,
        )
        .with_step(written.step.clone());
        if let Some(server_id) = released {
            transition = transition.with_detail(format!("released server {server_id}"));
        }
        self.store.record_transition(transition).await
    }
}
