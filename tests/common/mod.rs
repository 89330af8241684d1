//! Shared integration test helpers: an in-memory core on a manual clock, scripted
//! step executors and fleet builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use provisioner::backend::SimulatedBackend;
use provisioner::billing::InMemorySubscriptions;
use provisioner::config::{ProvisionerConfig, StoreBackend};
use provisioner::models::{NewServer, ProvisioningTask, ServerStatus};
use provisioner::orchestration::{
    CoreComponents, ExecutorRegistry, ProvisionerCore, StepExecutor, StepResult,
};
use provisioner::store::{InMemoryStore, ManualClock};

pub const TEST_WORKER: &str = "test-worker";

/// Step executor that replays a scripted list of results, then succeeds
pub struct ScriptedExecutor {
    name: &'static str,
    script: Mutex<VecDeque<StepResult>>,
    calls: AtomicUsize,
    per_task: Mutex<HashMap<i64, usize>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn ok(name: &'static str) -> Arc<Self> {
        Self::scripted(name, Vec::new())
    }

    pub fn scripted(name: &'static str, results: Vec<StepResult>) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
            per_task: Mutex::new(HashMap::new()),
            delay: None,
        })
    }

    pub fn always(name: &'static str, result: StepResult, times: usize) -> Arc<Self> {
        Self::scripted(name, vec![result; times])
    }

    pub fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            per_task: Mutex::new(HashMap::new()),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, task_id: i64) -> usize {
        self.per_task.lock().get(&task_id).copied().unwrap_or(0)
    }

    pub fn per_task_calls(&self) -> HashMap<i64, usize> {
        self.per_task.lock().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    fn step_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_task.lock().entry(task.id).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| StepResult::success(json!({"step": self.name, "task_id": task.id})))
    }
}

pub fn registry(executors: &[Arc<ScriptedExecutor>]) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for executor in executors {
        registry.register(executor.clone());
    }
    registry
}

/// Configuration for in-memory tests: 10s base backoff, no jitter, 3 attempts
pub fn test_config() -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.scheduler.worker_count = 4;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.default_max_retries = 3;
    config.backoff.base_delay_ms = 10_000;
    config.backoff.max_delay_ms = 600_000;
    config.backoff.jitter_enabled = false;
    config.execution.step_timeout_seconds = 5;
    config.recovery.enabled = false;
    config
}

pub fn server(name: &str, max_accounts: i32, current_accounts: i32) -> NewServer {
    NewServer {
        name: name.to_string(),
        hostname: format!("{name}.fleet.internal"),
        control_panel_kind: "simulated".to_string(),
        max_accounts,
        current_accounts,
        status: ServerStatus::Active,
    }
}

/// Payload with an explicit step list for `domain`
pub fn payload(domain: &str, steps: &[&str]) -> Value {
    json!({"domain": domain, "steps": steps})
}

pub struct TestHarness {
    pub core: Arc<ProvisionerCore>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub billing: Arc<InMemorySubscriptions>,
    pub backend: Arc<SimulatedBackend>,
}

pub struct HarnessBuilder {
    config: ProvisionerConfig,
    executors: Option<ExecutorRegistry>,
    billing: Arc<InMemorySubscriptions>,
    fleet: Vec<NewServer>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            executors: None,
            billing: Arc::new(InMemorySubscriptions::new()),
            fleet: vec![server("web-01", 10, 0)],
        }
    }

    pub fn with_config(mut self, configure: impl FnOnce(&mut ProvisionerConfig)) -> Self {
        configure(&mut self.config);
        self
    }

    pub fn with_executors(mut self, executors: &[Arc<ScriptedExecutor>]) -> Self {
        self.executors = Some(registry(executors));
        self
    }

    pub fn with_registry(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Share a billing gateway the test's own executors also hold
    pub fn with_billing(mut self, billing: Arc<InMemorySubscriptions>) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_fleet(mut self, fleet: Vec<NewServer>) -> Self {
        self.fleet = fleet;
        self
    }

    pub async fn build(self) -> TestHarness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let billing = self.billing;
        let backend = Arc::new(SimulatedBackend::new());

        let mut components = CoreComponents::in_memory(store.clone(), backend.clone())
            .with_billing(billing.clone());
        if let Some(executors) = self.executors {
            components = components.with_executors(executors);
        }
        let core = Arc::new(ProvisionerCore::assemble(self.config, components));
        core.register_fleet(self.fleet).await.unwrap();

        TestHarness {
            core,
            store,
            clock,
            billing,
            backend,
        }
    }
}

impl TestHarness {
    /// Deliver the billing paid hook, which opens the subscription's task
    pub async fn paid(&self, subscription_id: i64, payload: Value) -> ProvisioningTask {
        self.core
            .on_subscription_paid(subscription_id, payload)
            .await
            .unwrap()
    }

    /// Process everything claimable at the current manual time
    pub async fn drain(&self) -> usize {
        self.core
            .scheduler
            .process_available(TEST_WORKER)
            .await
            .unwrap()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub async fn task(&self, task_id: i64) -> ProvisioningTask {
        self.core.get_task(task_id).await.unwrap()
    }

    pub async fn server_load(&self, server_id: i64) -> i32 {
        self.core
            .list_servers()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == server_id)
            .map(|s| s.current_accounts)
            .unwrap()
    }

    pub async fn total_load(&self) -> i32 {
        self.core
            .list_servers()
            .await
            .unwrap()
            .iter()
            .map(|s| s.current_accounts)
            .sum()
    }
}

// Re-exported so test files only import from `common`
pub use provisioner::billing::SubscriptionGateway;
