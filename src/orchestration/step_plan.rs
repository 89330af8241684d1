//! # Step Plan
//!
//! The ordered step sequence for a task, derived from its payload:
//!
//! - an explicit `"steps": [...]` list wins;
//! - otherwise `"product_kind"` plus optional `"features"` decide:
//!   - `website` (default): `allocate_server → create_vhost → [create_database] →
//!     [create_mailbox] → issue_certificate → schedule_backup`
//!   - `email`: `create_mailbox`
//!   - `database`: `allocate_server → create_database`
//!
//! Optional website steps are included when `features` contains `"database"` /
//! `"mailbox"`.

use serde_json::Value;

use crate::constants::steps;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::models::ProvisioningTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    steps: Vec<String>,
}

impl StepPlan {
    pub fn new(steps: Vec<String>) -> ProvisionerResult<Self> {
        if steps.is_empty() {
            return Err(ProvisionerError::ValidationError(
                "step plan must contain at least one step".to_string(),
            ));
        }
        if let Some(blank) = steps.iter().find(|s| s.trim().is_empty()) {
            return Err(ProvisionerError::ValidationError(format!(
                "step plan contains an empty step name: {blank:?}"
            )));
        }
        Ok(Self { steps })
    }

    pub fn for_task(task: &ProvisioningTask) -> ProvisionerResult<Self> {
        Self::from_payload(&task.payload)
    }

    pub fn from_payload(payload: &Value) -> ProvisionerResult<Self> {
        if let Some(explicit) = payload.get("steps") {
            let list = explicit.as_array().ok_or_else(|| {
                ProvisionerError::ValidationError("payload.steps must be an array".to_string())
            })?;
            let names = list
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        ProvisionerError::ValidationError(format!(
                            "payload.steps entries must be strings, got {v}"
                        ))
                    })
                })
                .collect::<ProvisionerResult<Vec<_>>>()?;
            return Self::new(names);
        }

        let kind = payload
            .get("product_kind")
            .and_then(Value::as_str)
            .unwrap_or("website");
        let has_feature = |feature: &str| {
            payload
                .get("features")
                .and_then(Value::as_array)
                .is_some_and(|list| list.iter().any(|f| f.as_str() == Some(feature)))
        };

        let plan: Vec<&str> = match kind {
            "website" => {
                let mut plan = vec![steps::ALLOCATE_SERVER, steps::CREATE_VHOST];
                if has_feature("database") {
                    plan.push(steps::CREATE_DATABASE);
                }
                if has_feature("mailbox") {
                    plan.push(steps::CREATE_MAILBOX);
                }
                plan.extend([steps::ISSUE_CERTIFICATE, steps::SCHEDULE_BACKUP]);
                plan
            }
            "email" => vec![steps::CREATE_MAILBOX],
            "database" => vec![steps::ALLOCATE_SERVER, steps::CREATE_DATABASE],
            other => {
                return Err(ProvisionerError::ValidationError(format!(
                    "unknown product kind '{other}'"
                )))
            }
        };

        Self::new(plan.into_iter().map(str::to_string).collect())
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Index to resume from given the task's persisted step
    pub fn resume_index(&self, current: Option<&str>) -> ProvisionerResult<usize> {
        match current {
            None => Ok(0),
            Some(step) => self.steps.iter().position(|s| s == step).ok_or_else(|| {
                ProvisionerError::ValidationError(format!(
                    "persisted step '{step}' is not part of the plan"
                ))
            }),
        }
    }

    pub fn next_after(&self, index: usize) -> Option<&str> {
        self.steps.get(index + 1).map(String::as_str)
    }
}
