//! # Data Model
//!
//! Records owned or read by the orchestrator: provisioning tasks, fleet servers,
//! subscriptions (read through billing), failed-job views and the transition log.

pub mod failed_job;
pub mod server;
pub mod subscription;
pub mod task;
pub mod task_transition;

pub use failed_job::FailedJobRecord;
pub use server::{NewServer, Server, ServerStatus};
pub use subscription::{Subscription, SubscriptionStatus};
pub use task::{ProvisioningTask, TaskUpdate};
pub use task_transition::{NewTaskTransition, TaskTransition};
