//! # Certificate Issuance
//!
//! Runs the ACME http-01 flow for the subscription's domain:
//!
//! 1. open (or reuse) an order,
//! 2. publish the challenge from the server that hosts the vhost,
//! 3. ask the CA to validate,
//! 4. finalize and install the certificate.
//!
//! Every stage is safe to repeat. A re-run after a crash picks up the open
//! order in whatever state the CA left it.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{backend_failure, require_domain, ExecutorContext};
use crate::backend::{AcmeOrder, OrderStatus};
use crate::constants::steps;
use crate::models::{ProvisioningTask, Server};
use crate::orchestration::step_executor::{StepExecutor, StepResult};

const STEP: &str = steps::ISSUE_CERTIFICATE;

pub struct CertificateExecutor {
    context: ExecutorContext,
}

impl CertificateExecutor {
    pub fn new(context: ExecutorContext) -> Self {
        Self { context }
    }

    /// Drive a pending order through challenge publication and validation
    async fn authorize(&self, server: &Server, order: &AcmeOrder) -> Result<(), StepResult> {
        let backend = &self.context.backend;
        let challenge = backend
            .acme_http01_challenge(&order.order_id)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;
        backend
            .publish_challenge(server, &order.domain, &challenge)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;

        let status = backend
            .acme_validate(&order.order_id)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;
        debug!(order_id = %order.order_id, ?status, "ACME validation result");

        match status {
            OrderStatus::Ready | OrderStatus::Valid => Ok(()),
            OrderStatus::Pending => Err(StepResult::transient(format!(
                "{STEP}: order {} still awaiting validation",
                order.order_id
            ))),
            OrderStatus::Invalid => Err(StepResult::permanent(format!(
                "{STEP}: CA rejected the http-01 challenge for {}",
                order.domain
            ))),
        }
    }

    async fn issue(&self, task: &ProvisioningTask) -> Result<StepResult, StepResult> {
        let domain = require_domain(task, STEP)?;
        let server = self.context.assigned_server(task, STEP).await?;
        let backend = &self.context.backend;

        let order = backend
            .acme_new_order(&domain)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;
        if order.status == OrderStatus::Pending {
            self.authorize(&server, &order).await?;
        }

        let certificate = backend
            .acme_finalize(&order.order_id)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;
        backend
            .install_certificate(&server, &certificate)
            .await
            .map_err(|e| backend_failure(STEP, &e))?;

        Ok(StepResult::success(json!({
            "order_id": order.order_id,
            "serial": certificate.serial,
            "domain": certificate.domain,
            "not_after": certificate.not_after.to_rfc3339(),
            "server_id": server.id,
        })))
    }
}

#[async_trait]
impl StepExecutor for CertificateExecutor {
    fn step_name(&self) -> &'static str {
        STEP
    }

    async fn execute(&self, task: &ProvisioningTask) -> StepResult {
        self.issue(task).await.unwrap_or_else(|failure| failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, FaultPlan, HostingBackend, VhostSpec};
    use crate::executors::test_support::{fixture, task, Fixture};
    use crate::orchestration::step_executor::ErrorKind;

    async fn with_vhost(fx: &Fixture, subscription_id: i64, domain: &str) {
        fx.backend
            .create_vhost(
                &fx.server,
                &VhostSpec {
                    subscription_id,
                    domain: domain.to_string(),
                    document_root: format!("/var/www/{domain}/public"),
                    php_version: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_issues_and_installs_certificate() {
        let fx = fixture().await;
        with_vhost(&fx, 1, "secure.test").await;
        let executor = CertificateExecutor::new(fx.context.clone());

        let result = executor
            .execute(&task(1, Some(fx.server.id), json!({"domain": "secure.test"})))
            .await;

        assert!(result.success, "{:?}", result.detail);
        let serial = result.result_data.unwrap()["serial"].as_str().unwrap().to_string();
        assert_eq!(fx.backend.installed_certificate("secure.test"), Some(serial));
    }

    #[tokio::test]
    async fn test_rerun_reuses_issued_certificate() {
        let fx = fixture().await;
        with_vhost(&fx, 1, "secure.test").await;
        let executor = CertificateExecutor::new(fx.context.clone());
        let t = task(1, Some(fx.server.id), json!({"domain": "secure.test"}));

        let first = executor.execute(&t).await.result_data.unwrap();
        let second = executor.execute(&t).await.result_data.unwrap();
        assert_eq!(first["serial"], second["serial"]);
        assert_eq!(fx.backend.call_count("publish_challenge"), 1);
    }

    #[tokio::test]
    async fn test_unpublishable_challenge_is_permanent() {
        let fx = fixture().await;
        let executor = CertificateExecutor::new(fx.context.clone());
        let result = executor
            .execute(&task(1, Some(fx.server.id), json!({"domain": "novhost.test"})))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    }

    #[tokio::test]
    async fn test_rate_limited_ca_is_transient() {
        let fx = fixture().await;
        with_vhost(&fx, 1, "secure.test").await;
        fx.backend.inject(
            "acme_new_order",
            FaultPlan::new().fail(1, BackendError::RateLimited("too many orders".to_string())),
        );
        let executor = CertificateExecutor::new(fx.context.clone());
        let t = task(1, Some(fx.server.id), json!({"domain": "secure.test"}));

        assert!(executor.execute(&t).await.is_transient());
        assert!(executor.execute(&t).await.success);
    }
}
