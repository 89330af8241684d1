//! # Stats Aggregator
//!
//! Per-status task counts over a trailing window of days, computed from the
//! task store on every call.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProvisionerError, ProvisionerResult};
use crate::state_machine::TaskStatus;
use crate::store::TaskStore;

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_days: u32,
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub failed: i64,
}

impl WindowStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.success + self.failed
    }
}

pub struct StatsAggregator {
    store: Arc<dyn TaskStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn window_stats(&self, window_days: u32) -> ProvisionerResult<WindowStats> {
        if window_days == 0 {
            return Err(ProvisionerError::ValidationError(
                "window must cover at least one day".to_string(),
            ));
        }

        let window = Duration::from_secs(u64::from(window_days) * SECONDS_PER_DAY);
        let counts = self.store.status_counts(window).await?;
        let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);

        Ok(WindowStats {
            window_days,
            pending: count(TaskStatus::Pending),
            processing: count(TaskStatus::Processing),
            success: count(TaskStatus::Success),
            failed: count(TaskStatus::Failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, ManualClock};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_only_tasks_inside_window() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        store.create(1, json!({}), 3).await.unwrap();
        store.claim_next_pending("w").await.unwrap();
        clock.advance(Duration::from_secs(3 * SECONDS_PER_DAY));
        store.create(2, json!({}), 3).await.unwrap();
        store.create(3, json!({}), 3).await.unwrap();

        let stats = StatsAggregator::new(store);
        let recent = stats.window_stats(1).await.unwrap();
        assert_eq!(recent.total(), 2);

        let week = stats.window_stats(7).await.unwrap();
        assert_eq!(week.total(), 3);
        assert_eq!(week.processing, 1);
        assert_eq!(week.pending, 2);
    }

    #[tokio::test]
    async fn test_zero_day_window_rejected() {
        let stats = StatsAggregator::new(Arc::new(InMemoryStore::new()));
        assert!(stats.window_stats(0).await.is_err());
    }
}
