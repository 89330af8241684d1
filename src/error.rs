//! Error types for the provisioning orchestrator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisionerError {
    #[error("Subscription {subscription_id} already has an active provisioning task")]
    DuplicateActiveTask { subscription_id: i64 },
    #[error("Provisioning task {0} not found")]
    TaskNotFound(i64),
    #[error("Server {0} not found")]
    ServerNotFound(i64),
    #[error("Stale write on task {task_id}: expected version {expected_version}")]
    StaleWrite { task_id: i64, expected_version: i64 },
    #[error("No active server has spare capacity")]
    NoCapacity,
    #[error("Task store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("State transition error: {0}")]
    StateTransitionError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Billing gateway error: {0}")]
    BillingError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisionerError {
    /// Errors after which no further tasks can be claimed
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<serde_json::Error> for ProvisionerError {
    fn from(error: serde_json::Error) -> Self {
        ProvisionerError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for ProvisionerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ProvisionerError::StoreUnavailable(err.to_string())
            }
            other => ProvisionerError::DatabaseError(other.to_string()),
        }
    }
}

impl From<crate::state_machine::StateMachineError> for ProvisionerError {
    fn from(err: crate::state_machine::StateMachineError) -> Self {
        ProvisionerError::StateTransitionError(err.to_string())
    }
}

impl From<crate::config::ConfigurationError> for ProvisionerError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        ProvisionerError::ConfigurationError(err.to_string())
    }
}

pub type ProvisionerResult<T> = std::result::Result<T, ProvisionerError>;
