//! # Orchestration Engine
//!
//! Drives provisioning tasks from `pending` to a terminal state.
//!
//! ## Core Components
//!
//! - **Scheduler**: fixed worker pool; each worker claims, processes and persists
//! - **TaskProcessor**: runs one claimed task through its step plan
//! - **StepPlan**: ordered step names derived from the task payload
//! - **ServerAllocator**: least-loaded reservation and release of fleet slots
//! - **BackoffCalculator**: exponential delay between transient retries
//! - **ErrorClassifier**: maps backend and store errors to transient/permanent
//! - **StalenessDetector**: returns abandoned claims to the pool
//! - **DeadLetterTracker**: lists and clears tasks that exhausted their retries
//! - **StatsAggregator**: per-status counts over a trailing window
//! - **ProvisionerCore**: bootstrap and the operations exposed to billing and admins

pub mod backoff_calculator;
pub mod core;
pub mod dead_letter;
pub mod error_classifier;
pub mod scheduler;
pub mod server_allocator;
pub mod staleness_detector;
pub mod stats;
pub mod step_executor;
pub mod step_plan;
pub mod task_processor;

pub use backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig};
pub use self::core::{CoreComponents, HealthReport, ManualProvisionRequest, ProvisionerCore};
pub use dead_letter::DeadLetterTracker;
pub use error_classifier::{ErrorCategory, ErrorClassification};
pub use scheduler::Scheduler;
pub use server_allocator::ServerAllocator;
pub use staleness_detector::StalenessDetector;
pub use stats::{StatsAggregator, WindowStats};
pub use step_executor::{ErrorKind, ExecutorRegistry, StepExecutor, StepResult};
pub use step_plan::StepPlan;
pub use task_processor::{ProcessOutcome, TaskProcessor};
