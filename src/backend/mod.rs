//! # Hosting Backend
//!
//! The boundary between step executors and the machines that actually host
//! accounts. A production deployment implements [`HostingBackend`] over its control
//! panel API; [`SimulatedBackend`] keeps resources in memory and can inject faults.
//!
//! Every call is keyed by natural identifiers (domain, database name, mailbox
//! address, ACME order) so repeating a call after a crash or retry finds the
//! resource that already exists instead of creating a second one.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Server;

pub use simulated::{FaultPlan, SimulatedBackend};

/// Failures reported by a hosting backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Resource conflict: {0}")]
    Conflict(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Server fault: {0}")]
    ServerFault(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhostSpec {
    pub subscription_id: i64,
    pub domain: String,
    pub document_root: String,
    pub php_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub subscription_id: i64,
    pub name: String,
    pub user: String,
    pub quota_mb: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSpec {
    pub subscription_id: i64,
    pub address: String,
    pub quota_mb: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSpec {
    pub subscription_id: i64,
    pub cron: String,
    pub retention_days: u32,
}

/// Handle returned for any created resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub resource_id: String,
    /// `false` when the call found the resource already in place
    pub created: bool,
}

/// ACME order state after authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Ready,
    Invalid,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeOrder {
    pub order_id: String,
    pub domain: String,
    pub status: OrderStatus,
}

/// http-01 challenge the server must publish under `/.well-known/acme-challenge/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http01Challenge {
    pub token: String,
    pub key_authorization: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial: String,
    pub domain: String,
    pub not_after: chrono::DateTime<chrono::Utc>,
}

/// Operations the built-in executors need from the hosting fleet
#[async_trait]
pub trait HostingBackend: Send + Sync {
    async fn create_vhost(&self, server: &Server, spec: &VhostSpec) -> BackendResult<ResourceHandle>;

    async fn create_database(
        &self,
        server: &Server,
        spec: &DatabaseSpec,
    ) -> BackendResult<ResourceHandle>;

    /// Mail is hosted centrally and does not need an allocated server
    async fn create_mailbox(&self, spec: &MailboxSpec) -> BackendResult<ResourceHandle>;

    /// Open (or reuse) an ACME order for `domain`
    async fn acme_new_order(&self, domain: &str) -> BackendResult<AcmeOrder>;

    async fn acme_http01_challenge(&self, order_id: &str) -> BackendResult<Http01Challenge>;

    /// Serve the challenge response from the server hosting `domain`
    async fn publish_challenge(
        &self,
        server: &Server,
        domain: &str,
        challenge: &Http01Challenge,
    ) -> BackendResult<()>;

    /// Ask the CA to validate the published challenge
    async fn acme_validate(&self, order_id: &str) -> BackendResult<OrderStatus>;

    async fn acme_finalize(&self, order_id: &str) -> BackendResult<IssuedCertificate>;

    async fn install_certificate(
        &self,
        server: &Server,
        certificate: &IssuedCertificate,
    ) -> BackendResult<()>;

    async fn schedule_backup(&self, server: &Server, spec: &BackupSpec) -> BackendResult<ResourceHandle>;
}
