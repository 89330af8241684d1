//! # Task Processor
//!
//! Runs one claimed task through its step plan. The processor owns the task for
//! the duration of the claim and is the only writer of its step progress:
//!
//! ```text
//! claimed ──► [cancelled?] ──► ensure server ──► execute step ──► [cancelled?]
//!                                                     │
//!               ┌─────────────── success ─────────────┤
//!               ▼                                     ▼ failure
//!     advance / complete                 retry later │ fail
//! ```
//!
//! Every write goes through [`TaskStateMachine::apply`] and the store's optimistic
//! `update_status`. A write that loses a version race is re-read and retried a
//! bounded number of times; if the re-read shows the claim now belongs to someone
//! else (stale-claim recovery), the processor lets go of the task.
//!
//! Server slots are given back *after* the releasing write has been persisted, so a
//! crash in between can only leave a slot over-counted, never double-booked.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::billing::SubscriptionGateway;
use crate::constants::{actors, events, steps};
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::logging::{log_step_operation, log_task_operation};
use crate::models::{NewTaskTransition, ProvisioningTask, SubscriptionStatus, TaskUpdate};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};
use crate::store::TaskStore;

use super::backoff_calculator::BackoffCalculator;
use super::error_classifier::classify_provisioner_error;
use super::server_allocator::ServerAllocator;
use super::step_executor::{ExecutorRegistry, StepResult};
use super::step_plan::StepPlan;

/// How a claim ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Every step succeeded
    Completed,
    /// Returned to `pending` after a transient failure
    RetryScheduled { delay: Duration },
    /// Moved to `failed`
    Failed { error: String },
    /// Subscription was cancelled while the task was in flight
    Cancelled,
    /// The claim was taken over (stale-claim recovery) before the task finished
    Superseded,
}

enum Allocation {
    Held(ProvisioningTask),
    Unavailable(ProvisionerError),
    Lost,
}

/// Transition metadata for one persisted event
struct Audit<'a> {
    event: &'static str,
    step: Option<&'a str>,
    detail: Option<String>,
}

pub struct TaskProcessor {
    store: Arc<dyn TaskStore>,
    allocator: Arc<ServerAllocator>,
    executors: Arc<ExecutorRegistry>,
    billing: Arc<dyn SubscriptionGateway>,
    backoff: BackoffCalculator,
    step_timeout: Duration,
    stale_write_retry_limit: u32,
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("executors", &self.executors)
            .field("step_timeout", &self.step_timeout)
            .field("stale_write_retry_limit", &self.stale_write_retry_limit)
            .finish()
    }
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        allocator: Arc<ServerAllocator>,
        executors: Arc<ExecutorRegistry>,
        billing: Arc<dyn SubscriptionGateway>,
        backoff: BackoffCalculator,
        step_timeout: Duration,
        stale_write_retry_limit: u32,
    ) -> Self {
        Self {
            store,
            allocator,
            executors,
            billing,
            backoff,
            step_timeout,
            stale_write_retry_limit,
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Run a task that `claim_next_pending` just handed out.
    ///
    /// Step failures are outcomes, not errors. `Err` means the store could not
    /// be written; the claim then stays in place until stale-claim recovery.
    #[instrument(skip(self, task), fields(task_id = task.id, subscription_id = task.subscription_id, attempt = task.attempts))]
    pub async fn process(&self, task: ProvisioningTask) -> ProvisionerResult<ProcessOutcome> {
        log_task_operation(
            "claim",
            Some(task.id),
            Some(task.subscription_id),
            task.status.as_str(),
            task.claimed_by.as_deref(),
        );
        self.audit(
            NewTaskTransition::new(
                task.id,
                Some(TaskStatus::Pending),
                task.status,
                events::TASK_CLAIMED,
                actors::SCHEDULER,
            )
            .with_step(task.step.clone())
            .with_detail(format!(
                "claimed by {} (attempt {}/{})",
                task.claimed_by.as_deref().unwrap_or("unknown"),
                task.attempts,
                task.max_retries
            )),
        )
        .await?;

        let plan = match StepPlan::for_task(&task) {
            Ok(plan) => plan,
            Err(e) => return self.fail(task, None, e.to_string()).await,
        };
        let mut index = match plan.resume_index(task.step.as_deref()) {
            Ok(index) => index,
            Err(e) => return self.fail(task, None, e.to_string()).await,
        };
        let mut task = task;

        loop {
            let step = plan.steps()[index].clone();

            if self.is_cancelled(task.subscription_id).await {
                return self.cancel(task, &step).await;
            }

            if task.server_id.is_none()
                && (step == steps::ALLOCATE_SERVER || steps::requires_server(&step))
            {
                task = match self.ensure_server(&task).await? {
                    Allocation::Held(updated) => updated,
                    Allocation::Lost => return Ok(ProcessOutcome::Superseded),
                    Allocation::Unavailable(e) => {
                        let result = classify_provisioner_error(&e).into_step_result(&step);
                        return self.handle_failure(task, &step, result).await;
                    }
                };
            }

            let result = if step == steps::ALLOCATE_SERVER {
                StepResult::success(json!({ "server_id": task.server_id }))
            } else {
                self.run_executor(&task, &step).await
            };
            log_step_operation(
                "execute",
                task.id,
                &step,
                task.attempts,
                if result.success { "success" } else { "failure" },
                result.detail.as_deref(),
            );

            if !result.success {
                return self.handle_failure(task, &step, result).await;
            }

            if self.is_cancelled(task.subscription_id).await {
                return self.cancel(task, &step).await;
            }

            let Some(next) = plan.next_after(index) else {
                return self.complete(task, &step, result).await;
            };

            let event = TaskEvent::AdvanceStep {
                completed_step: step.clone(),
                next_step: next.to_string(),
                result_data: result.result_data,
            };
            let audit = Audit {
                event: events::STEP_COMPLETED,
                step: Some(&step),
                detail: Some(format!("next step {next}")),
            };
            task = match self.persist(&task, event, audit, |_| {}).await? {
                Some(written) => written,
                None => return Ok(ProcessOutcome::Superseded),
            };
            index += 1;
        }
    }

    async fn run_executor(&self, task: &ProvisioningTask, step: &str) -> StepResult {
        let Some(executor) = self.executors.get(step) else {
            return StepResult::permanent(format!("{step}: no executor registered"));
        };

        let owned = task.clone();
        let mut handle = tokio::spawn(async move { executor.execute(&owned).await });
        match tokio::time::timeout(self.step_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(task_id = task.id, step, %join_error, "Step executor panicked");
                StepResult::permanent(format!("{step}: executor panicked"))
            }
            Err(_) => {
                handle.abort();
                warn!(task_id = task.id, step, timeout = ?self.step_timeout, "Step timed out");
                StepResult::transient(format!(
                    "{step}: timed out after {}s",
                    self.step_timeout.as_secs_f64()
                ))
            }
        }
    }

    /// Reserve a server, following the task through version races
    async fn ensure_server(&self, task: &ProvisioningTask) -> ProvisionerResult<Allocation> {
        let mut current = task.clone();
        let mut stale_writes = 0;
        loop {
            match self.allocator.allocate(&current).await {
                Ok(updated) => return Ok(Allocation::Held(updated)),
                Err(ProvisionerError::StaleWrite { .. })
                    if stale_writes < self.stale_write_retry_limit =>
                {
                    stale_writes += 1;
                    match self.reload_owned(&current).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(Allocation::Lost),
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => return Ok(Allocation::Unavailable(e)),
            }
        }
    }

    async fn handle_failure(
        &self,
        task: ProvisioningTask,
        step: &str,
        result: StepResult,
    ) -> ProvisionerResult<ProcessOutcome> {
        let message = result.error_message();

        if !result.is_transient() || task.retries_exhausted() {
            return self.fail(task, Some(step), message).await;
        }

        let delay = self.backoff.delay_for_attempt(task.attempts);
        let released = task.server_id.filter(|_| result.server_fault);
        let event = TaskEvent::RetryLater {
            error: message,
            delay,
            release_server: released.is_some(),
        };
        let audit = Audit {
            event: events::TASK_RETRY_SCHEDULED,
            step: Some(step),
            detail: Some(match released {
                Some(server_id) => format!(
                    "retry in {}s, released faulty server {server_id}",
                    delay.as_secs_f64()
                ),
                None => format!("retry in {}s", delay.as_secs_f64()),
            }),
        };
        let step_name = step.to_string();
        let Some(written) = self
            .persist(&task, event, audit, move |u| u.step = Some(step_name.clone()))
            .await?
        else {
            return Ok(ProcessOutcome::Superseded);
        };

        if let Some(server_id) = released {
            self.allocator.release(server_id, Some(task.id)).await?;
        }
        log_task_operation(
            "retry_scheduled",
            Some(written.id),
            Some(written.subscription_id),
            written.status.as_str(),
            written.error_message.as_deref(),
        );
        Ok(ProcessOutcome::RetryScheduled { delay })
    }

    async fn fail(
        &self,
        task: ProvisioningTask,
        step: Option<&str>,
        error: String,
    ) -> ProvisionerResult<ProcessOutcome> {
        let written = self
            .finish_releasing(&task, TaskEvent::fail_with_error(error.clone()), events::TASK_FAILED, step)
            .await?;
        if let Some(written) = written {
            warn!(
                task_id = written.id,
                attempts = written.attempts,
                max_retries = written.max_retries,
                error = %error,
                "Provisioning task failed"
            );
            log_task_operation(
                "fail",
                Some(written.id),
                Some(written.subscription_id),
                written.status.as_str(),
                Some(&error),
            );
            Ok(ProcessOutcome::Failed { error })
        } else {
            Ok(ProcessOutcome::Superseded)
        }
    }

    async fn cancel(&self, task: ProvisioningTask, step: &str) -> ProvisionerResult<ProcessOutcome> {
        info!(task_id = task.id, step, "Subscription cancelled, stopping task");
        match self
            .finish_releasing(&task, TaskEvent::Cancel, events::TASK_CANCELLED, Some(step))
            .await?
        {
            Some(written) => {
                log_task_operation(
                    "cancel",
                    Some(written.id),
                    Some(written.subscription_id),
                    written.status.as_str(),
                    None,
                );
                Ok(ProcessOutcome::Cancelled)
            }
            None => Ok(ProcessOutcome::Superseded),
        }
    }

    /// Persist a terminal failure, then give the task's server back
    async fn finish_releasing(
        &self,
        task: &ProvisioningTask,
        event: TaskEvent,
        event_name: &'static str,
        step: Option<&str>,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        let held = task.server_id;
        let audit = Audit {
            event: event_name,
            step,
            detail: held.map(|server_id| format!("released server {server_id}")),
        };
        let step_name = step.map(str::to_string);
        let written = self
            .persist(task, event, audit, move |u| {
                u.server_id = None;
                if let Some(name) = &step_name {
                    u.step = Some(name.clone());
                }
            })
            .await?;

        if written.is_some() {
            if let Some(server_id) = held {
                self.allocator.release(server_id, Some(task.id)).await?;
            }
        }
        Ok(written)
    }

    async fn complete(
        &self,
        task: ProvisioningTask,
        step: &str,
        result: StepResult,
    ) -> ProvisionerResult<ProcessOutcome> {
        let event = TaskEvent::Complete {
            completed_step: step.to_string(),
            result_data: result.result_data,
        };
        let audit = Audit {
            event: events::TASK_COMPLETED,
            step: Some(step),
            detail: task.server_id.map(|id| format!("hosted on server {id}")),
        };
        let Some(written) = self.persist(&task, event, audit, |_| {}).await? else {
            return Ok(ProcessOutcome::Superseded);
        };

        if let Err(e) = self
            .billing
            .set_status(written.subscription_id, SubscriptionStatus::Active)
            .await
        {
            warn!(
                subscription_id = written.subscription_id,
                error = %e,
                "Could not mark subscription active"
            );
        }
        info!(
            task_id = written.id,
            attempts = written.attempts,
            server_id = ?written.server_id,
            "✅ Provisioning task completed"
        );
        log_task_operation(
            "complete",
            Some(written.id),
            Some(written.subscription_id),
            written.status.as_str(),
            None,
        );
        Ok(ProcessOutcome::Completed)
    }

    /// Apply `event`, write it optimistically and log the transition.
    ///
    /// Returns `None` when the claim is no longer ours.
    async fn persist<F>(
        &self,
        task: &ProvisioningTask,
        event: TaskEvent,
        audit: Audit<'_>,
        adjust: F,
    ) -> ProvisionerResult<Option<ProvisioningTask>>
    where
        F: Fn(&mut TaskUpdate),
    {
        let mut current = task.clone();
        let mut stale_writes = 0;

        let written = loop {
            let mut update = TaskStateMachine::apply(&current, &event)?;
            adjust(&mut update);

            match self
                .store
                .update_status(current.id, current.version, update)
                .await
            {
                Ok(written) => break written,
                Err(ProvisionerError::StaleWrite { .. })
                    if stale_writes < self.stale_write_retry_limit =>
                {
                    stale_writes += 1;
                    debug!(
                        task_id = current.id,
                        version = current.version,
                        stale_writes,
                        "Lost version race, re-reading task"
                    );
                    match self.reload_owned(&current).await? {
                        Some(fresh) => current = fresh,
                        None => {
                            warn!(task_id = current.id, "Claim was taken over, abandoning task");
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let mut transition = NewTaskTransition::new(
            written.id,
            Some(current.status),
            written.status,
            audit.event,
            actors::SCHEDULER,
        )
        .with_step(audit.step.map(str::to_string));
        if let Some(detail) = audit.detail.or_else(|| event.error_message().map(str::to_string)) {
            transition = transition.with_detail(detail);
        }
        self.audit(transition).await?;

        Ok(Some(written))
    }

    /// Fresh copy of the task if this worker still holds its claim
    async fn reload_owned(
        &self,
        task: &ProvisioningTask,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        let fresh = self.store.get(task.id).await?;
        let owned = fresh.status == TaskStatus::Processing && fresh.claimed_by == task.claimed_by;
        Ok(owned.then_some(fresh))
    }

    /// The transition log is secondary; only a dead store stops the task
    async fn audit(&self, transition: NewTaskTransition) -> ProvisionerResult<()> {
        match self.store.record_transition(transition).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "Could not record task transition");
                Ok(())
            }
        }
    }

    async fn is_cancelled(&self, subscription_id: i64) -> bool {
        match self.billing.status(subscription_id).await {
            Ok(status) => status.is_some_and(|s| s.is_cancelled()),
            Err(e) => {
                warn!(subscription_id, error = %e, "Billing status check failed, continuing");
                false
            }
        }
    }
}
