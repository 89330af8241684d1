//! # Provisioning Task Model
//!
//! The unit of provisioning work for one subscription. A task carries an opaque JSON
//! payload (domain, sizing, product features) which also accumulates the result data
//! of completed steps under `artifacts`, keyed by step name, so later steps can read
//! what earlier ones created.
//!
//! Every mutation goes through [`TaskUpdate`] and the store's optimistic
//! `update_status`, which compares `version`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::state_machine::TaskStatus;

/// Payload key holding per-step result data
pub const ARTIFACTS_KEY: &str = "artifacts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub id: i64,
    pub subscription_id: i64,
    pub status: TaskStatus,
    /// Current or last step name; `None` until the first step starts
    pub step: Option<String>,
    pub attempts: i32,
    pub max_retries: i32,
    pub payload: Value,
    pub error_message: Option<String>,
    pub server_id: Option<i64>,
    pub version: i64,
    /// Earliest instant at which a `pending` task may be claimed again
    pub backoff_until: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningTask {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Whether `claim_next_pending` may hand this task out at `now`
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.backoff_until.map_or(true, |until| until <= now)
    }

    /// Domain requested for the subscription, if any
    pub fn domain(&self) -> Option<&str> {
        self.payload.get("domain").and_then(Value::as_str)
    }

    /// Result data recorded by a completed step
    pub fn artifact(&self, step: &str) -> Option<&Value> {
        self.payload.get(ARTIFACTS_KEY).and_then(|a| a.get(step))
    }
}

/// Full set of mutable task fields written by `update_status`.
///
/// `backoff` is relative: the store computes `backoff_until` from its own clock
/// at write time so that `updated_at + delay` holds exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub step: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub payload: Value,
    pub server_id: Option<i64>,
    pub backoff: Option<Duration>,
    pub claimed_by: Option<String>,
}

impl From<&ProvisioningTask> for TaskUpdate {
    fn from(task: &ProvisioningTask) -> Self {
        Self {
            status: task.status,
            step: task.step.clone(),
            error_message: task.error_message.clone(),
            attempts: task.attempts,
            payload: task.payload.clone(),
            server_id: task.server_id,
            backoff: None,
            claimed_by: task.claimed_by.clone(),
        }
    }
}

impl TaskUpdate {
    /// Merge a step's result data into the payload's artifacts
    pub fn record_artifact(&mut self, step: &str, data: Value) {
        if !self.payload.is_object() {
            self.payload = Value::Object(Map::new());
        }
        if let Some(root) = self.payload.as_object_mut() {
            let artifacts = root
                .entry(ARTIFACTS_KEY)
                .or_insert_with(|| Value::Object(Map::new()));
            if !artifacts.is_object() {
                *artifacts = Value::Object(Map::new());
            }
            if let Some(map) = artifacts.as_object_mut() {
                map.insert(step.to_string(), data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> ProvisioningTask {
        let now = Utc::now();
        ProvisioningTask {
            id: 1,
            subscription_id: 10,
            status: TaskStatus::Pending,
            step: None,
            attempts: 0,
            max_retries: 3,
            payload: json!({"domain": "example.com"}),
            error_message: None,
            server_id: None,
            version: 0,
            backoff_until: None,
            claimed_by: None,
            cleared_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_record_artifact_keeps_existing_payload() {
        let task = sample_task();
        let mut update = TaskUpdate::from(&task);
        update.record_artifact("create_database", json!({"name": "db_10"}));
        update.record_artifact("create_vhost", json!({"document_root": "/srv/example"}));

        assert_eq!(update.payload["domain"], "example.com");
        assert_eq!(update.payload["artifacts"]["create_database"]["name"], "db_10");
        assert_eq!(
            update.payload["artifacts"]["create_vhost"]["document_root"],
            "/srv/example"
        );
    }

    #[test]
    fn test_backoff_blocks_claim_until_elapsed() {
        let mut task = sample_task();
        let now = Utc::now();
        task.backoff_until = Some(now + chrono::Duration::seconds(10));

        assert!(!task.is_claimable_at(now));
        assert!(task.is_claimable_at(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_artifact_lookup() {
        let mut task = sample_task();
        task.payload = json!({"artifacts": {"create_vhost": {"server": 3}}});
        assert_eq!(task.artifact("create_vhost").unwrap()["server"], 3);
        assert!(task.artifact("issue_certificate").is_none());
        assert_eq!(task.domain(), None);
    }
}
