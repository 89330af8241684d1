//! # Step Error Classification
//!
//! Turns backend failures and orchestration errors met while running a step into
//! a transient/permanent decision, an error code for logs, and the
//! [`StepResult`] the task processor acts on.
//!
//! ```text
//! Timeout, RateLimited, Unavailable  ──▶ transient
//! ServerFault                        ──▶ transient + release server
//! Conflict, Invalid                  ──▶ permanent
//! NoCapacity                         ──▶ transient (held until a server frees up)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::step_executor::{ErrorKind, StepResult};
use crate::backend::BackendError;
use crate::error::ProvisionerError;

/// Primary error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    RateLimit,
    Unavailable,
    ServerFault,
    Capacity,
    Conflict,
    Validation,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::RateLimit => write!(f, "Rate Limit"),
            ErrorCategory::Unavailable => write!(f, "Unavailable"),
            ErrorCategory::ServerFault => write!(f, "Server Fault"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Conflict => write!(f, "Conflict"),
            ErrorCategory::Validation => write!(f, "Validation"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub kind: ErrorKind,
    /// Specific error code for tracking
    pub error_code: &'static str,
    pub message: String,
    pub server_fault: bool,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Step result carrying this classification, prefixed with the step name
    pub fn into_step_result(self, step_name: &str) -> StepResult {
        let result = StepResult::failure(
            self.kind,
            format!("{step_name}: [{}] {}", self.error_code, self.message),
        );
        if self.server_fault {
            result.with_server_fault()
        } else {
            result
        }
    }
}

pub fn classify_backend_error(error: &BackendError) -> ErrorClassification {
    let (category, kind, error_code, server_fault) = match error {
        BackendError::Timeout(_) => (
            ErrorCategory::Timeout,
            ErrorKind::Transient,
            "BACKEND_TIMEOUT",
            false,
        ),
        BackendError::RateLimited(_) => (
            ErrorCategory::RateLimit,
            ErrorKind::Transient,
            "BACKEND_RATE_LIMITED",
            false,
        ),
        BackendError::Unavailable(_) => (
            ErrorCategory::Unavailable,
            ErrorKind::Transient,
            "BACKEND_UNAVAILABLE",
            false,
        ),
        BackendError::ServerFault(_) => (
            ErrorCategory::ServerFault,
            ErrorKind::Transient,
            "SERVER_FAULT",
            true,
        ),
        BackendError::Conflict(_) => (
            ErrorCategory::Conflict,
            ErrorKind::Permanent,
            "RESOURCE_CONFLICT",
            false,
        ),
        BackendError::Invalid(_) => (
            ErrorCategory::Validation,
            ErrorKind::Permanent,
            "INVALID_REQUEST",
            false,
        ),
    };

    ErrorClassification {
        category,
        kind,
        error_code,
        message: error.to_string(),
        server_fault,
    }
}

/// Classify an orchestration error raised while preparing or running a step
pub fn classify_provisioner_error(error: &ProvisionerError) -> ErrorClassification {
    let (category, kind, error_code) = match error {
        ProvisionerError::NoCapacity => {
            (ErrorCategory::Capacity, ErrorKind::Transient, "NO_CAPACITY")
        }
        ProvisionerError::ServerNotFound(_) => (
            ErrorCategory::ServerFault,
            ErrorKind::Transient,
            "SERVER_NOT_FOUND",
        ),
        ProvisionerError::ValidationError(_) => (
            ErrorCategory::Validation,
            ErrorKind::Permanent,
            "INVALID_PAYLOAD",
        ),
        _ => (ErrorCategory::Internal, ErrorKind::Transient, "INTERNAL"),
    };

    ErrorClassification {
        category,
        kind,
        error_code,
        message: error.to_string(),
        server_fault: matches!(error, ProvisionerError::ServerNotFound(_)),
    }
}
