//! # Provisioner Core
//!
//! Single bootstrap path for every entry point (the binary, the admin API and the
//! integration tests). `ProvisionerCore` wires the store, billing, backend,
//! executors and worker pool together and exposes the operations the billing hook
//! and the admin dashboard call.
//!
//! ## Bootstrap
//!
//! - [`ProvisionerCore::from_config`] builds adapters from `store.backend`
//!   (in-memory or PostgreSQL) and registers the configured fleet when the
//!   registry is empty.
//! - [`ProvisionerCore::assemble`] takes ready-made adapters, for tests that want
//!   a manual clock, scripted executors or fault injection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::backend::{HostingBackend, SimulatedBackend};
use crate::billing::{InMemorySubscriptions, PgSubscriptionGateway, SubscriptionGateway};
use crate::config::{ConfigManager, ProvisionerConfig, StoreBackend};
use crate::constants::{actors, events};
use crate::database::{run_migrations, DatabaseConnection};
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::executors::{builtin_registry, ExecutorContext};
use crate::logging::log_task_operation;
use crate::models::{
    FailedJobRecord, NewServer, NewTaskTransition, ProvisioningTask, Server, Subscription,
    SubscriptionStatus, TaskTransition,
};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};
use crate::store::{InMemoryStore, PgStore, ServerRegistry, TaskStore};

use super::backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig};
use super::dead_letter::DeadLetterTracker;
use super::scheduler::Scheduler;
use super::server_allocator::ServerAllocator;
use super::staleness_detector::StalenessDetector;
use super::stats::{StatsAggregator, WindowStats};
use super::step_executor::ExecutorRegistry;
use super::task_processor::TaskProcessor;

/// Adapters the core is assembled from
pub struct CoreComponents {
    pub store: Arc<dyn TaskStore>,
    pub servers: Arc<dyn ServerRegistry>,
    pub billing: Arc<dyn SubscriptionGateway>,
    pub backend: Arc<dyn HostingBackend>,
    /// Built-in executors over `backend` when `None`
    pub executors: Option<ExecutorRegistry>,
}

impl CoreComponents {
    /// Single-process adapters: one in-memory store for tasks and servers
    pub fn in_memory(store: Arc<InMemoryStore>, backend: Arc<dyn HostingBackend>) -> Self {
        Self {
            store: store.clone(),
            servers: store,
            billing: Arc::new(InMemorySubscriptions::new()),
            backend,
            executors: None,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn with_billing(mut self, billing: Arc<dyn SubscriptionGateway>) -> Self {
        self.billing = billing;
        self
    }
}

/// Manual provisioning request from the admin dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualProvisionRequest {
    pub subscription_id: i64,
    pub customer_id: i64,
    pub product_id: i64,
    pub domain: String,
    /// Extra payload fields (product kind, features, sizing, explicit steps)
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store: String,
    pub shutting_down: bool,
}

pub struct ProvisionerCore {
    pub store: Arc<dyn TaskStore>,
    pub servers: Arc<dyn ServerRegistry>,
    pub billing: Arc<dyn SubscriptionGateway>,
    pub allocator: Arc<ServerAllocator>,
    pub scheduler: Arc<Scheduler>,
    pub staleness_detector: Arc<StalenessDetector>,
    pub dead_letters: DeadLetterTracker,
    pub stats: StatsAggregator,
    config: ProvisionerConfig,
}

impl ProvisionerCore {
    /// Build every adapter from configuration
    pub async fn from_config(manager: Arc<ConfigManager>) -> ProvisionerResult<Self> {
        let config = manager.config().clone();
        info!(
            environment = manager.environment(),
            backend = ?config.store.backend,
            "🔧 Initializing provisioner core"
        );

        let backend: Arc<dyn HostingBackend> = Arc::new(SimulatedBackend::new());
        let components = match config.store.backend {
            StoreBackend::Memory => {
                CoreComponents::in_memory(Arc::new(InMemoryStore::new()), backend)
            }
            StoreBackend::Postgres => {
                let connection = DatabaseConnection::connect(&config.database).await?;
                let pool = connection.pool().clone();
                if config.database.run_migrations {
                    run_migrations(&pool).await?;
                }
                let store = Arc::new(PgStore::new(pool.clone()));
                CoreComponents {
                    store: store.clone(),
                    servers: store,
                    billing: Arc::new(PgSubscriptionGateway::new(pool)),
                    backend,
                    executors: None,
                }
            }
        };

        let core = Self::assemble(config, components);
        core.register_configured_fleet().await?;
        Ok(core)
    }

    /// Wire ready-made adapters together
    pub fn assemble(config: ProvisionerConfig, components: CoreComponents) -> Self {
        let CoreComponents {
            store,
            servers,
            billing,
            backend,
            executors,
        } = components;

        let allocator = Arc::new(ServerAllocator::new(servers.clone()));
        let executors = executors.unwrap_or_else(|| {
            builtin_registry(ExecutorContext::new(backend, servers.clone()))
        });
        info!(steps = ?executors.step_names(), "Step executors registered");

        let processor = Arc::new(TaskProcessor::new(
            store.clone(),
            allocator.clone(),
            Arc::new(executors),
            billing.clone(),
            BackoffCalculator::new(BackoffCalculatorConfig::from_config(&config.backoff)),
            config.execution.step_timeout(),
            config.scheduler.stale_write_retry_limit,
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            processor,
            &config.scheduler,
        ));
        let staleness_detector = Arc::new(
            StalenessDetector::new(
                store.clone(),
                config.recovery.grace_period(),
                config.recovery.detection_interval(),
            )
            .with_wakeup(scheduler.wakeup_handle()),
        );
        let dead_letters = DeadLetterTracker::new(store.clone(), allocator.clone(), billing.clone());
        let stats = StatsAggregator::new(store.clone());

        Self {
            store,
            servers,
            billing,
            allocator,
            scheduler,
            staleness_detector,
            dead_letters,
            stats,
            config,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    fn wakeup(&self) -> Arc<Notify> {
        self.scheduler.wakeup_handle()
    }

    /// Run stale-claim recovery and the worker pool until shutdown.
    ///
    /// Returns `StoreUnavailable` when the pool halted on a dead store.
    pub async fn run(&self) -> ProvisionerResult<()> {
        let detector = if self.config.recovery.enabled {
            let detector = self.staleness_detector.clone();
            let shutdown = self.scheduler.shutdown_signal();
            Some(tokio::spawn(async move { detector.run(shutdown).await }))
        } else {
            None
        };

        let result = self.scheduler.run().await;
        self.scheduler.shutdown();

        if let Some(handle) = detector {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Staleness detector stopped with error"),
                Err(join_error) => warn!(%join_error, "Staleness detector terminated abnormally"),
            }
        }
        result
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Billing hook: a subscription was paid for
    #[instrument(skip(self, payload))]
    pub async fn on_subscription_paid(
        &self,
        subscription_id: i64,
        payload: Value,
    ) -> ProvisionerResult<ProvisioningTask> {
        self.billing
            .register(subscription_from_payload(
                subscription_id,
                &payload,
                SubscriptionStatus::PendingProvisioning,
            ))
            .await?;
        let task = self
            .create_task(subscription_id, payload, actors::BILLING, "subscription paid")
            .await?;
        self.reopen_subscription(subscription_id).await?;
        Ok(task)
    }

    /// Admin dashboard: provision a subscription by hand
    #[instrument(skip(self, request), fields(subscription_id = request.subscription_id))]
    pub async fn manual_provision(
        &self,
        request: ManualProvisionRequest,
    ) -> ProvisionerResult<ProvisioningTask> {
        if request.domain.trim().is_empty() {
            return Err(ProvisionerError::ValidationError(
                "domain must not be empty".to_string(),
            ));
        }

        let mut payload = match request.payload {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ProvisionerError::ValidationError(
                    "payload must be a JSON object".to_string(),
                ))
            }
        };
        payload.insert("domain".to_string(), Value::from(request.domain.clone()));
        payload.insert("customer_id".to_string(), Value::from(request.customer_id));
        payload.insert("product_id".to_string(), Value::from(request.product_id));

        self.billing
            .register(Subscription {
                id: request.subscription_id,
                customer_id: request.customer_id,
                product_id: request.product_id,
                domain: Some(request.domain),
                status: SubscriptionStatus::PendingProvisioning,
            })
            .await?;

        let task = self
            .create_task(
                request.subscription_id,
                Value::Object(payload),
                actors::ADMIN,
                "manual provision",
            )
            .await?;
        self.reopen_subscription(request.subscription_id).await?;
        Ok(task)
    }

    /// A new task was opened, so billing's record goes back to pending even if
    /// an earlier task left it cancelled, failed or active
    async fn reopen_subscription(&self, subscription_id: i64) -> ProvisionerResult<()> {
        match self.billing.status(subscription_id).await? {
            Some(SubscriptionStatus::PendingProvisioning) | None => Ok(()),
            Some(previous) => {
                debug!(subscription_id, %previous, "Reopening subscription for new task");
                self.billing
                    .set_status(subscription_id, SubscriptionStatus::PendingProvisioning)
                    .await
            }
        }
    }

    async fn create_task(
        &self,
        subscription_id: i64,
        payload: Value,
        actor: &str,
        detail: &str,
    ) -> ProvisionerResult<ProvisioningTask> {
        let task = self
            .store
            .create(
                subscription_id,
                payload,
                self.config.scheduler.default_max_retries,
            )
            .await?;

        self.store
            .record_transition(
                NewTaskTransition::new(task.id, None, task.status, events::TASK_CREATED, actor)
                    .with_detail(detail),
            )
            .await?;
        log_task_operation(
            "create",
            Some(task.id),
            Some(subscription_id),
            task.status.as_str(),
            Some(detail),
        );
        self.wakeup().notify_one();
        Ok(task)
    }

    /// Admin retry of a failed task; it resumes at its persisted step
    #[instrument(skip(self))]
    pub async fn retry(&self, task_id: i64) -> ProvisionerResult<ProvisioningTask> {
        let task = self.store.get(task_id).await?;
        let update = TaskStateMachine::apply(&task, &TaskEvent::ManualRetry)?;
        let written = self
            .store
            .update_status(task.id, task.version, update)
            .await?;

        self.store
            .record_transition(
                NewTaskTransition::new(
                    written.id,
                    Some(task.status),
                    written.status,
                    events::TASK_RETRY_REQUESTED,
                    actors::ADMIN,
                )
                .with_step(written.step.clone())
                .with_detail(format!(
                    "previous error: {}",
                    task.error_message.as_deref().unwrap_or("none")
                )),
            )
            .await?;
        log_task_operation(
            "retry",
            Some(written.id),
            Some(written.subscription_id),
            written.status.as_str(),
            None,
        );
        self.wakeup().notify_one();
        Ok(written)
    }

    /// Billing hook: the subscription was cancelled.
    ///
    /// A pending task fails right away; a processing task is stopped by its
    /// worker at the next step boundary.
    #[instrument(skip(self))]
    pub async fn on_subscription_cancelled(
        &self,
        subscription_id: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        let mut current = self.store.find_active_for_subscription(subscription_id).await?;

        // Workers only see the cancellation through billing, so the record must exist
        if let Some(task) = &current {
            self.billing
                .register(subscription_from_payload(
                    subscription_id,
                    &task.payload,
                    SubscriptionStatus::Cancelled,
                ))
                .await?;
        }
        self.billing
            .set_status(subscription_id, SubscriptionStatus::Cancelled)
            .await?;

        let mut stale_writes = 0;
        loop {
            let Some(task) = current else {
                return Ok(None);
            };
            if task.status != TaskStatus::Pending {
                info!(task_id = task.id, "Task in flight, its worker will stop it");
                return Ok(Some(task));
            }

            match self.cancel_pending(&task).await {
                Ok(written) => return Ok(Some(written)),
                Err(ProvisionerError::StaleWrite { .. })
                    if stale_writes < self.config.scheduler.stale_write_retry_limit =>
                {
                    stale_writes += 1;
                    debug!(
                        task_id = task.id,
                        version = task.version,
                        stale_writes,
                        "Task moved while cancelling, re-reading"
                    );
                    current = self.store.find_active_for_subscription(subscription_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cancel_pending(&self, task: &ProvisioningTask) -> ProvisionerResult<ProvisioningTask> {
        let held = task.server_id;
        let mut update = TaskStateMachine::apply(task, &TaskEvent::Cancel)?;
        update.server_id = None;
        let written = self
            .store
            .update_status(task.id, task.version, update)
            .await?;
        if let Some(server_id) = held {
            self.allocator.release(server_id, Some(task.id)).await?;
        }

        let mut transition = NewTaskTransition::new(
            written.id,
            Some(task.status),
            written.status,
            events::TASK_CANCELLED,
            actors::BILLING,
        )
        .with_step(written.step.clone());
        if let Some(server_id) = held {
            transition = transition.with_detail(format!("released server {server_id}"));
        }
        self.store.record_transition(transition).await?;
        log_task_operation(
            "cancel",
            Some(written.id),
            Some(written.subscription_id),
            written.status.as_str(),
            None,
        );
        Ok(written)
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
    ) -> ProvisionerResult<Vec<ProvisioningTask>> {
        self.store.list_by_status(status, None).await
    }

    pub async fn get_task(&self, task_id: i64) -> ProvisionerResult<ProvisioningTask> {
        self.store.get(task_id).await
    }

    pub async fn transitions(&self, task_id: i64) -> ProvisionerResult<Vec<TaskTransition>> {
        self.store.get(task_id).await?;
        self.store.transitions(task_id).await
    }

    /// Counts over `window_days`, or the configured default window
    pub async fn window_stats(&self, window_days: Option<u32>) -> ProvisionerResult<WindowStats> {
        self.stats
            .window_stats(window_days.unwrap_or(self.config.stats.default_window_days))
            .await
    }

    pub async fn failed_jobs(&self) -> ProvisionerResult<Vec<FailedJobRecord>> {
        self.dead_letters.list().await
    }

    pub async fn clear_failed_jobs(
        &self,
        task_id: Option<i64>,
    ) -> ProvisionerResult<Vec<FailedJobRecord>> {
        self.dead_letters.clear(task_id).await
    }

    pub async fn list_servers(&self) -> ProvisionerResult<Vec<Server>> {
        self.servers.list_servers().await
    }

    /// Upsert fleet members by hostname
    pub async fn register_fleet(&self, servers: Vec<NewServer>) -> ProvisionerResult<Vec<Server>> {
        let mut registered = Vec::with_capacity(servers.len());
        for server in servers {
            registered.push(self.servers.register_server(server).await?);
        }
        Ok(registered)
    }

    async fn register_configured_fleet(&self) -> ProvisionerResult<()> {
        if self.config.fleet.servers.is_empty() || !self.servers.list_servers().await?.is_empty() {
            return Ok(());
        }
        let registered = self.register_fleet(self.config.fleet.servers.clone()).await?;
        info!(count = registered.len(), "Registered configured fleet");
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let store = self.store.health_check().await;
        HealthReport {
            healthy: store.is_ok() && !self.scheduler.is_shutting_down(),
            store: match store {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            shutting_down: self.scheduler.is_shutting_down(),
        }
    }
}

/// Billing record for a subscription known only from its task payload
fn subscription_from_payload(
    subscription_id: i64,
    payload: &Value,
    status: SubscriptionStatus,
) -> Subscription {
    let id_field = |key: &str| payload.get(key).and_then(Value::as_i64).unwrap_or_default();
    Subscription {
        id: subscription_id,
        customer_id: id_field("customer_id"),
        product_id: id_field("product_id"),
        domain: payload
            .get("domain")
            .and_then(Value::as_str)
            .map(str::to_string),
        status,
    }
}
