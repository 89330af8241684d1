#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Hosting Provisioner
//!
//! Provisioning orchestrator for a web hosting company. When billing reports a paid
//! subscription, a provisioning task is created; a pool of workers claims tasks and
//! runs their steps (server allocation, vhost, database, mailbox, certificate,
//! backup schedule) against the hosting fleet, retrying transient failures with
//! exponential backoff and parking exhausted tasks in a dead-letter list.
//!
//! ## Module Organization
//!
//! - [`models`] - tasks, servers, subscriptions, transitions, failed-job records
//! - [`state_machine`] - task lifecycle transitions as pure functions
//! - [`store`] - task store and server registry (in-memory and PostgreSQL)
//! - [`billing`] - subscription status boundary
//! - [`backend`] - hosting fleet interface and a simulated fleet
//! - [`executors`] - built-in step executors
//! - [`orchestration`] - scheduler, task processor, allocator, recovery, stats
//! - [`web`] - admin dashboard HTTP API
//! - [`config`] / [`logging`] / [`error`] - ambient stack
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provisioner::config::ConfigManager;
//! use provisioner::orchestration::ProvisionerCore;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let core = ProvisionerCore::from_config(manager).await?;
//!
//! let task = core
//!     .on_subscription_paid(42, json!({"domain": "example.com", "features": ["database"]}))
//!     .await?;
//! println!("created task {}", task.id);
//!
//! core.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod billing;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod executors;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;
pub mod web;

pub use config::{ConfigManager, ProvisionerConfig};
pub use error::{ProvisionerError, ProvisionerResult};
pub use models::{FailedJobRecord, ProvisioningTask, Server, TaskTransition};
pub use orchestration::ProvisionerCore;
pub use state_machine::TaskStatus;
