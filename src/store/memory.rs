//! # In-Memory Store
//!
//! Single-process [`TaskStore`] + [`ServerRegistry`] behind one `parking_lot` mutex.
//! Every operation takes the lock exactly once, so the claim and the reservation are
//! atomic in the same sense as the conditional updates of the PostgreSQL adapter.
//!
//! Time comes from an injectable [`Clock`] so tests can move past backoff windows and
//! stale-claim grace periods without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{to_chrono, ServerRegistry, TaskStore};
use crate::constants::messages;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::models::{
    NewServer, NewTaskTransition, ProvisioningTask, Server, ServerStatus, TaskTransition,
    TaskUpdate,
};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};

/// Source of "now" for the store
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_chrono(by);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_task_id: i64,
    next_server_id: i64,
    next_transition_id: i64,
    tasks: BTreeMap<i64, ProvisioningTask>,
    servers: BTreeMap<i64, Server>,
    transitions: Vec<TaskTransition>,
}

impl MemoryState {
    fn active_task_for(&self, subscription_id: i64, except: Option<i64>) -> Option<i64> {
        self.tasks
            .values()
            .find(|t| {
                t.subscription_id == subscription_id
                    && !t.is_terminal()
                    && Some(t.id) != except
            })
            .map(|t| t.id)
    }

    fn write_update(
        &mut self,
        task_id: i64,
        update: TaskUpdate,
        now: DateTime<Utc>,
    ) -> ProvisionerResult<ProvisioningTask> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(ProvisionerError::TaskNotFound(task_id))?;
        task.status = update.status;
        task.step = update.step;
        task.error_message = update.error_message;
        task.attempts = update.attempts;
        task.payload = update.payload;
        task.server_id = update.server_id;
        task.backoff_until = update.backoff.map(|d| now + to_chrono(d));
        task.claimed_by = update.claimed_by;
        task.version += 1;
        task.updated_at = now;
        Ok(task.clone())
    }

    fn release_slot(&mut self, server_id: i64) -> Option<&Server> {
        let server = self.servers.get_mut(&server_id)?;
        server.current_accounts = (server.current_accounts - 1).max(0);
        Some(server)
    }
}

/// In-process store used by the test suite and for dry runs
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Simulate an outage: every operation fails with `StoreUnavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> ProvisionerResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProvisionerError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create(
        &self,
        subscription_id: i64,
        payload: Value,
        max_retries: i32,
    ) -> ProvisionerResult<ProvisioningTask> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.active_task_for(subscription_id, None).is_some() {
            return Err(ProvisionerError::DuplicateActiveTask { subscription_id });
        }

        state.next_task_id += 1;
        let task = ProvisioningTask {
            id: state.next_task_id,
            subscription_id,
            status: TaskStatus::Pending,
            step: None,
            attempts: 0,
            max_retries,
            payload,
            error_message: None,
            server_id: None,
            version: 0,
            backoff_until: None,
            claimed_by: None,
            cleared_at: None,
            created_at: now,
            updated_at: now,
        };
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: i64) -> ProvisionerResult<ProvisioningTask> {
        self.ensure_available()?;
        self.state
            .lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(ProvisionerError::TaskNotFound(task_id))
    }

    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        update: TaskUpdate,
    ) -> ProvisionerResult<ProvisioningTask> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let current = state
            .tasks
            .get(&task_id)
            .ok_or(ProvisionerError::TaskNotFound(task_id))?;
        if current.version != expected_version {
            return Err(ProvisionerError::StaleWrite {
                task_id,
                expected_version,
            });
        }
        if !update.status.is_terminal() && current.is_terminal() {
            let subscription_id = current.subscription_id;
            if state.active_task_for(subscription_id, Some(task_id)).is_some() {
                return Err(ProvisionerError::DuplicateActiveTask { subscription_id });
            }
        }

        state.write_update(task_id, update, now)
    }

    async fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        window: Option<Duration>,
    ) -> ProvisionerResult<Vec<ProvisioningTask>> {
        self.ensure_available()?;
        let since = window.map(|w| self.clock.now() - to_chrono(w));
        let state = self.state.lock();

        let mut tasks: Vec<ProvisioningTask> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| since.map_or(true, |since| t.updated_at >= since))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    async fn claim_next_pending(
        &self,
        worker_id: &str,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let Some(candidate) = state
            .tasks
            .values()
            .filter(|t| t.is_claimable_at(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
        else {
            return Ok(None);
        };

        let update = TaskStateMachine::apply(
            candidate,
            &TaskEvent::Claim {
                worker_id: worker_id.to_string(),
            },
        )?;
        let task_id = candidate.id;
        let claimed = state.write_update(task_id, update, now)?;
        debug!(task_id, worker_id, attempts = claimed.attempts, "Claimed task");
        Ok(Some(claimed))
    }

    async fn find_active_for_subscription(
        &self,
        subscription_id: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(state
            .active_task_for(subscription_id, None)
            .and_then(|id| state.tasks.get(&id).cloned()))
    }

    async fn recover_stale_claims(
        &self,
        grace: Duration,
    ) -> ProvisionerResult<Vec<ProvisioningTask>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let cutoff = now - to_chrono(grace);
        let mut state = self.state.lock();

        let stale: Vec<ProvisioningTask> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing && t.updated_at <= cutoff)
            .cloned()
            .collect();

        let mut recovered = Vec::with_capacity(stale.len());
        for task in stale {
            let update = if task.retries_exhausted() {
                let mut update = TaskStateMachine::apply(
                    &task,
                    &TaskEvent::fail_with_error(messages::ABANDONED),
                )?;
                if let Some(server_id) = update.server_id.take() {
                    state.release_slot(server_id);
                }
                update
            } else {
                TaskStateMachine::apply(&task, &TaskEvent::RecoverStale)?
            };
            warn!(
                task_id = task.id,
                claimed_by = ?task.claimed_by,
                to_status = %update.status,
                "Recovering stale claim"
            );
            recovered.push(state.write_update(task.id, update, now)?);
        }
        Ok(recovered)
    }

    async fn list_dead_letters(&self) -> ProvisionerResult<Vec<ProvisioningTask>> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Failed && t.retries_exhausted() && t.cleared_at.is_none()
            })
            .cloned()
            .collect())
    }

    async fn mark_cleared(
        &self,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<ProvisioningTask> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(ProvisionerError::TaskNotFound(task_id))?;
        if task.version != expected_version {
            return Err(ProvisionerError::StaleWrite {
                task_id,
                expected_version,
            });
        }
        if task.status != TaskStatus::Failed {
            return Err(ProvisionerError::ValidationError(format!(
                "Task {task_id} is {} and cannot be cleared",
                task.status
            )));
        }
        task.cleared_at = Some(now);
        task.version += 1;
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn record_transition(&self, transition: NewTaskTransition) -> ProvisionerResult<()> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.next_transition_id += 1;
        let record = TaskTransition {
            id: state.next_transition_id,
            task_id: transition.task_id,
            from_status: transition.from_status,
            to_status: transition.to_status,
            event: transition.event,
            step: transition.step,
            actor: transition.actor,
            detail: transition.detail,
            created_at: now,
        };
        state.transitions.push(record);
        Ok(())
    }

    async fn transitions(&self, task_id: i64) -> ProvisionerResult<Vec<TaskTransition>> {
        self.ensure_available()?;
        Ok(self
            .state
            .lock()
            .transitions
            .iter()
            .filter(|t| t.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> ProvisionerResult<()> {
        self.ensure_available()
    }
}

#[async_trait]
impl ServerRegistry for InMemoryStore {
    async fn register_server(&self, server: NewServer) -> ProvisionerResult<Server> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if let Some(existing) = state
            .servers
            .values_mut()
            .find(|s| s.hostname == server.hostname)
        {
            existing.name = server.name;
            existing.control_panel_kind = server.control_panel_kind;
            existing.max_accounts = server.max_accounts;
            existing.status = server.status;
            return Ok(existing.clone());
        }

        state.next_server_id += 1;
        let registered = Server {
            id: state.next_server_id,
            name: server.name,
            hostname: server.hostname,
            control_panel_kind: server.control_panel_kind,
            max_accounts: server.max_accounts,
            current_accounts: server.current_accounts.max(0),
            status: server.status,
        };
        state.servers.insert(registered.id, registered.clone());
        Ok(registered)
    }

    async fn get_server(&self, server_id: i64) -> ProvisionerResult<Server> {
        self.ensure_available()?;
        self.state
            .lock()
            .servers
            .get(&server_id)
            .cloned()
            .ok_or(ProvisionerError::ServerNotFound(server_id))
    }

    async fn list_servers(&self) -> ProvisionerResult<Vec<Server>> {
        self.ensure_available()?;
        Ok(self.state.lock().servers.values().cloned().collect())
    }

    async fn reserve_server(
        &self,
        server_id: i64,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let task = state
            .tasks
            .get(&task_id)
            .ok_or(ProvisionerError::TaskNotFound(task_id))?;
        if task.version != expected_version {
            return Err(ProvisionerError::StaleWrite {
                task_id,
                expected_version,
            });
        }
        let mut update = TaskUpdate::from(task);

        let server = state
            .servers
            .get_mut(&server_id)
            .ok_or(ProvisionerError::ServerNotFound(server_id))?;
        if server.status != ServerStatus::Active || server.current_accounts >= server.max_accounts {
            return Ok(None);
        }
        server.current_accounts += 1;

        update.server_id = Some(server_id);
        state.write_update(task_id, update, now).map(Some)
    }

    async fn release_server(&self, server_id: i64) -> ProvisionerResult<Server> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        state
            .release_slot(server_id)
            .cloned()
            .ok_or(ProvisionerError::ServerNotFound(server_id))
    }
}
