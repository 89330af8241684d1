use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Events that drive provisioning task transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// A worker took the task (the store applies this atomically)
    Claim { worker_id: String },
    /// The current step succeeded and another step follows
    AdvanceStep {
        completed_step: String,
        next_step: String,
        result_data: Option<Value>,
    },
    /// The final step succeeded
    Complete {
        completed_step: String,
        result_data: Option<Value>,
    },
    /// A transient failure with retries remaining
    RetryLater {
        error: String,
        delay: Duration,
        release_server: bool,
    },
    /// Permanent failure or retries exhausted
    Fail { error: String },
    /// The owning subscription was cancelled
    Cancel,
    /// Administrator asked to run a failed task again
    ManualRetry,
    /// A claim was abandoned by a worker that went away
    RecoverStale,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::AdvanceStep { .. } => "advance_step",
            Self::Complete { .. } => "complete",
            Self::RetryLater { .. } => "retry_later",
            Self::Fail { .. } => "fail",
            Self::Cancel => "cancel",
            Self::ManualRetry => "manual_retry",
            Self::RecoverStale => "recover_stale",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::RetryLater { error, .. } | Self::Fail { error } => Some(error),
            _ => None,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
        }
    }
}
