//! Admin API handlers, one module per resource.

pub mod billing;
pub mod failed_jobs;
pub mod health;
pub mod servers;
pub mod stats;
pub mod tasks;
