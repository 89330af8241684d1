//! # Task Scheduler
//!
//! Fixed-size pool of workers pulling from the task store. Each worker loops
//! `claim → process → persist`; the atomic claim is the only point where workers
//! race. Idle workers sleep until the poll interval elapses, a new task wakes them,
//! or shutdown is requested.
//!
//! Store unavailability is the one fatal condition: the first worker that hits it
//! raises the alarm and stops the pool, and [`Scheduler::run`] returns the error.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::store::TaskStore;

use super::task_processor::{ProcessOutcome, TaskProcessor};

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    processor: Arc<TaskProcessor>,
    worker_count: usize,
    poll_interval: Duration,
    worker_id_prefix: String,
    /// Distinguishes pools on different hosts that share a pid (containers)
    instance_id: String,
    wakeup: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Everything one worker needs, cloned into its tokio task
#[derive(Clone)]
struct Worker {
    id: String,
    store: Arc<dyn TaskStore>,
    processor: Arc<TaskProcessor>,
    poll_interval: Duration,
    wakeup: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: Arc<TaskProcessor>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            processor,
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval(),
            worker_id_prefix: config.worker_id_prefix.clone(),
            instance_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            wakeup: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Notified whenever a task becomes claimable outside the pool's own writes
    pub fn wakeup_handle(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Receiver that flips to `true` once shutdown is requested
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every worker to stop after its current task
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!(
            "{}-{}-{}-worker-{index}",
            self.worker_id_prefix,
            std::process::id(),
            self.instance_id
        )
    }

    /// Run the worker pool until shutdown or a fatal store error
    #[instrument(skip(self), fields(workers = self.worker_count))]
    pub async fn run(&self) -> ProvisionerResult<()> {
        info!(
            workers = self.worker_count,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "🚀 Starting provisioning workers"
        );

        let mut workers = JoinSet::new();
        for index in 0..self.worker_count {
            let worker = Worker {
                id: self.worker_id(index),
                store: self.store.clone(),
                processor: self.processor.clone(),
                poll_interval: self.poll_interval,
                wakeup: self.wakeup.clone(),
                shutdown: self.shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        let mut fatal: Option<ProvisionerError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        error!(
                            error = %e,
                            "🚨 ALARM: task store unavailable, halting provisioning workers"
                        );
                        self.shutdown.send_replace(true);
                        fatal = Some(e);
                    }
                }
                Err(join_error) => {
                    error!(%join_error, "Provisioning worker terminated abnormally");
                }
            }
        }

        info!("All provisioning workers stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Claim and process tasks on the calling task until none is eligible.
    ///
    /// Used by tests and one-shot runs that want deterministic progress.
    pub async fn process_available(&self, worker_id: &str) -> ProvisionerResult<usize> {
        let mut processed = 0;
        while let Some(task) = self.store.claim_next_pending(worker_id).await? {
            match self.processor.process(task).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(worker_id, error = %e, "Task processing aborted"),
            }
            processed += 1;
        }
        Ok(processed)
    }
}

impl Worker {
    async fn run(self) -> ProvisionerResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        debug!(worker_id = %self.id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.claim_next_pending(&self.id).await {
                Ok(Some(task)) => {
                    let task_id = task.id;
                    match self.processor.process(task).await {
                        Ok(outcome) => self.log_outcome(task_id, &outcome),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(worker_id = %self.id, task_id, error = %e, "Task processing aborted");
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(worker_id = %self.id, error = %e, "Claim attempt failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    fn log_outcome(&self, task_id: i64, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Completed => {
                debug!(worker_id = %self.id, task_id, "Task completed");
            }
            ProcessOutcome::RetryScheduled { delay } => {
                debug!(worker_id = %self.id, task_id, delay_ms = delay.as_millis() as u64, "Task will be retried");
            }
            ProcessOutcome::Failed { error } => {
                debug!(worker_id = %self.id, task_id, %error, "Task failed");
            }
            ProcessOutcome::Cancelled => {
                debug!(worker_id = %self.id, task_id, "Task cancelled");
            }
            ProcessOutcome::Superseded => {
                warn!(worker_id = %self.id, task_id, "Task claim was superseded");
            }
        }
    }
}
