use thiserror::Error;

use super::states::TaskStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: TaskStatus, event: String },
    #[error("Guard rejected transition: {0}")]
    GuardFailed(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
