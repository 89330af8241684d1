// State machine module for provisioning tasks
//
// Transitions are computed as pure functions of (task, event) and persisted by the
// task store with an optimistic version check. Claiming is the one transition the
// store performs itself, atomically.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskStatus;
pub use task_state_machine::TaskStateMachine;
