//! # Task Store and Server Registry
//!
//! Durable record of provisioning tasks and of the server fleet. Every component
//! reaches persistence through these two traits; two adapters implement both:
//!
//! - [`memory::InMemoryStore`] - single-process store behind one lock, used by the
//!   test suite and for dry runs
//! - [`postgres::PgStore`] - PostgreSQL via sqlx; survives restarts
//!
//! ## Concurrency contract
//!
//! - `claim_next_pending` is the only operation allowed to race across workers. It
//!   is one atomic conditional update; two callers never receive the same task.
//! - `update_status` is optimistic: it succeeds only if the caller's
//!   `expected_version` still matches, otherwise `StaleWrite`.
//! - `create` (and any transition back to a non-terminal state) enforces at most
//!   one non-terminal task per subscription, otherwise `DuplicateActiveTask`.
//! - `reserve_server` increments `current_accounts` and assigns the task's
//!   `server_id` in one atomic step; `release_server` never goes below zero.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ProvisionerResult;
use crate::models::{
    NewServer, NewTaskTransition, ProvisioningTask, Server, TaskTransition, TaskUpdate,
};
use crate::state_machine::TaskStatus;

pub use memory::{Clock, InMemoryStore, ManualClock, SystemClock};
pub use postgres::PgStore;

/// Convert a std duration for timestamp arithmetic, saturating at one century
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5_200))
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a `pending` task for the subscription
    async fn create(
        &self,
        subscription_id: i64,
        payload: Value,
        max_retries: i32,
    ) -> ProvisionerResult<ProvisioningTask>;

    async fn get(&self, task_id: i64) -> ProvisionerResult<ProvisioningTask>;

    /// Optimistically write `update`; `StaleWrite` if the version moved
    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        update: TaskUpdate,
    ) -> ProvisionerResult<ProvisioningTask>;

    /// Tasks filtered by status and by `updated_at` inside the trailing window,
    /// most recently updated first
    async fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        window: Option<Duration>,
    ) -> ProvisionerResult<Vec<ProvisioningTask>>;

    /// Atomically move the oldest eligible `pending` task to `processing`
    async fn claim_next_pending(&self, worker_id: &str)
        -> ProvisionerResult<Option<ProvisioningTask>>;

    /// The subscription's non-terminal task, if any
    async fn find_active_for_subscription(
        &self,
        subscription_id: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>>;

    /// Return `processing` tasks untouched for longer than `grace` to `pending`
    /// (or to `failed` with "abandoned" when their attempts are used up)
    async fn recover_stale_claims(&self, grace: Duration)
        -> ProvisionerResult<Vec<ProvisioningTask>>;

    /// Failed tasks whose attempts reached `max_retries` and were not cleared
    async fn list_dead_letters(&self) -> ProvisionerResult<Vec<ProvisioningTask>>;

    /// Mark a failed task as cleared from the dead-letter list
    async fn mark_cleared(
        &self,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<ProvisioningTask>;

    async fn record_transition(&self, transition: NewTaskTransition) -> ProvisionerResult<()>;

    async fn transitions(&self, task_id: i64) -> ProvisionerResult<Vec<TaskTransition>>;

    /// Per-status counts over tasks updated inside the window
    async fn status_counts(&self, window: Duration) -> ProvisionerResult<HashMap<TaskStatus, i64>> {
        let mut counts = HashMap::new();
        for status in TaskStatus::ALL {
            let tasks = self.list_by_status(Some(status), Some(window)).await?;
            counts.insert(status, tasks.len() as i64);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> ProvisionerResult<()>;
}

#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn register_server(&self, server: NewServer) -> ProvisionerResult<Server>;

    async fn get_server(&self, server_id: i64) -> ProvisionerResult<Server>;

    /// All servers ordered by id
    async fn list_servers(&self) -> ProvisionerResult<Vec<Server>>;

    /// Take one account slot on `server_id` for `task_id`.
    ///
    /// Returns `None` when the server is inactive or full (another worker won the
    /// slot); `StaleWrite` when the task changed since `expected_version`.
    async fn reserve_server(
        &self,
        server_id: i64,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>>;

    /// Give one account slot back
    async fn release_server(&self, server_id: i64) -> ProvisionerResult<Server>;
}
