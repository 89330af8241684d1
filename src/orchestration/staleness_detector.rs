//! # Staleness Detector
//!
//! Returns abandoned claims to the pool. A `processing` task whose `updated_at`
//! is older than the grace period belongs to a worker that crashed or lost its
//! connection; the store moves it back to `pending`, or to `failed` with
//! `"abandoned"` when its attempts are already used up.
//!
//! Runs once at startup and then on a fixed interval until shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, instrument, warn};

use crate::constants::{actors, events};
use crate::error::ProvisionerResult;
use crate::logging::log_task_operation;
use crate::models::{NewTaskTransition, ProvisioningTask};
use crate::state_machine::TaskStatus;
use crate::store::TaskStore;

pub struct StalenessDetector {
    store: Arc<dyn TaskStore>,
    grace_period: Duration,
    interval: Duration,
    wakeup: Option<Arc<Notify>>,
}

impl StalenessDetector {
    pub fn new(store: Arc<dyn TaskStore>, grace_period: Duration, interval: Duration) -> Self {
        Self {
            store,
            grace_period,
            interval,
            wakeup: None,
        }
    }

    /// Wake idle workers when recovered tasks become claimable
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    /// One detection pass
    #[instrument(skip(self), fields(grace_secs = self.grace_period.as_secs()))]
    pub async fn run_once(&self) -> ProvisionerResult<Vec<ProvisioningTask>> {
        let recovered = self.store.recover_stale_claims(self.grace_period).await?;

        for task in &recovered {
            let event = if task.status == TaskStatus::Failed {
                events::TASK_FAILED
            } else {
                events::TASK_RECOVERED
            };
            let transition = NewTaskTransition::new(
                task.id,
                Some(TaskStatus::Processing),
                task.status,
                event,
                actors::RECOVERY,
            )
            .with_step(task.step.clone())
            .with_detail(format!(
                "claim older than {}s (attempt {}/{})",
                self.grace_period.as_secs(),
                task.attempts,
                task.max_retries
            ));
            if let Err(e) = self.store.record_transition(transition).await {
                warn!(task_id = task.id, error = %e, "Could not record recovery transition");
            }
            log_task_operation(
                "recover",
                Some(task.id),
                Some(task.subscription_id),
                task.status.as_str(),
                task.error_message.as_deref(),
            );
            if task.status == TaskStatus::Pending {
                if let Some(wakeup) = &self.wakeup {
                    wakeup.notify_one();
                }
            }
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered stale task claims");
        }
        Ok(recovered)
    }

    /// Detect on startup and every `interval` until `shutdown` flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ProvisionerResult<()> {
        loop {
            match self.run_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Staleness detection stopped: task store unavailable");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "Staleness detection pass failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, ManualClock};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_recovers_claims_past_grace_period() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let task = store.create(1, json!({}), 3).await.unwrap();
        store.claim_next_pending("crashed-worker").await.unwrap();

        let detector = StalenessDetector::new(
            store.clone(),
            Duration::from_secs(900),
            Duration::from_secs(60),
        );
        assert!(detector.run_once().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(901));
        let recovered = detector.run_once().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, TaskStatus::Pending);

        let log = store.transitions(task.id).await.unwrap();
        assert_eq!(log.last().unwrap().event, events::TASK_RECOVERED);
        assert_eq!(log.last().unwrap().actor, actors::RECOVERY);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let detector =
            StalenessDetector::new(store, Duration::from_secs(900), Duration::from_secs(3600));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { detector.run(rx).await });
        tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
