//! Audit trail of task state changes. One row per transition, written by whoever
//! drove it (scheduler, admin, recovery, billing).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub id: i64,
    pub task_id: i64,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub event: String,
    pub step: Option<String>,
    pub actor: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskTransition {
    pub task_id: i64,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub event: String,
    pub step: Option<String>,
    pub actor: String,
    pub detail: Option<String>,
}

impl NewTaskTransition {
    pub fn new(
        task_id: i64,
        from_status: Option<TaskStatus>,
        to_status: TaskStatus,
        event: &str,
        actor: &str,
    ) -> Self {
        Self {
            task_id,
            from_status,
            to_status,
            event: event.to_string(),
            step: None,
            actor: actor.to_string(),
            detail: None,
        }
    }

    pub fn with_step(mut self, step: Option<String>) -> Self {
        self.step = step;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
