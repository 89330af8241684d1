//! # Billing Boundary
//!
//! Subscriptions belong to billing. The orchestrator records each subscription it
//! opens a task for, reads its status (to notice cancellation between steps) and
//! writes it back: the hooks set `pending_provisioning` or `cancelled`, task success
//! marks it `active`, and clearing a dead-lettered task marks it `failed`.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::error::{ProvisionerError, ProvisionerResult};
use crate::models::{Subscription, SubscriptionStatus};

#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    /// Record a subscription billing knows about (manual provisioning, paid hook)
    async fn register(&self, subscription: Subscription) -> ProvisionerResult<()>;

    async fn get(&self, subscription_id: i64) -> ProvisionerResult<Option<Subscription>>;

    /// Current status; `None` when billing has no record of the subscription
    async fn status(&self, subscription_id: i64) -> ProvisionerResult<Option<SubscriptionStatus>> {
        Ok(self.get(subscription_id).await?.map(|s| s.status))
    }

    async fn set_status(
        &self,
        subscription_id: i64,
        status: SubscriptionStatus,
    ) -> ProvisionerResult<()>;
}

/// Gateway kept in process memory
#[derive(Debug, Default)]
pub struct InMemorySubscriptions {
    subscriptions: DashMap<i64, Subscription>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionGateway for InMemorySubscriptions {
    async fn register(&self, subscription: Subscription) -> ProvisionerResult<()> {
        self.subscriptions
            .entry(subscription.id)
            .or_insert(subscription);
        Ok(())
    }

    async fn get(&self, subscription_id: i64) -> ProvisionerResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .get(&subscription_id)
            .map(|s| s.value().clone()))
    }

    async fn set_status(
        &self,
        subscription_id: i64,
        status: SubscriptionStatus,
    ) -> ProvisionerResult<()> {
        match self.subscriptions.get_mut(&subscription_id) {
            Some(mut subscription) => {
                debug!(subscription_id, %status, "Subscription status updated");
                subscription.status = status;
            }
            None => warn!(subscription_id, %status, "Status update for unknown subscription"),
        }
        Ok(())
    }
}

/// Gateway over billing's `subscriptions` table
#[derive(Debug, Clone)]
pub struct PgSubscriptionGateway {
    pool: PgPool,
}

impl PgSubscriptionGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    customer_id: i64,
    product_id: i64,
    domain: Option<String>,
    status: String,
}

#[async_trait]
impl SubscriptionGateway for PgSubscriptionGateway {
    async fn register(&self, subscription: Subscription) -> ProvisionerResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions (id, customer_id, product_id, domain, status) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(subscription.id)
        .bind(subscription.customer_id)
        .bind(subscription.product_id)
        .bind(&subscription.domain)
        .bind(subscription.status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, subscription_id: i64) -> ProvisionerResult<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, customer_id, product_id, domain, status FROM subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Subscription {
                id: row.id,
                customer_id: row.customer_id,
                product_id: row.product_id,
                domain: row.domain,
                status: row.status.parse().map_err(ProvisionerError::BillingError)?,
            })
        })
        .transpose()
    }

    async fn set_status(
        &self,
        subscription_id: i64,
        status: SubscriptionStatus,
    ) -> ProvisionerResult<()> {
        let result =
            sqlx::query("UPDATE subscriptions SET status = $2, updated_at = now() WHERE id = $1")
                .bind(subscription_id)
                .bind(status.to_string())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            warn!(subscription_id, %status, "Status update for unknown subscription");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(id: i64) -> Subscription {
        Subscription {
            id,
            customer_id: 1,
            product_id: 1,
            domain: Some("shop.example".to_string()),
            status: SubscriptionStatus::PendingProvisioning,
        }
    }

    #[tokio::test]
    async fn test_register_keeps_first_record() {
        let gateway = InMemorySubscriptions::new();
        gateway.register(subscription(5)).await.unwrap();
        gateway
            .set_status(5, SubscriptionStatus::Cancelled)
            .await
            .unwrap();
        gateway.register(subscription(5)).await.unwrap();

        assert_eq!(
            gateway.status(5).await.unwrap(),
            Some(SubscriptionStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_unknown_subscription_has_no_status() {
        let gateway = InMemorySubscriptions::new();
        assert_eq!(gateway.status(404).await.unwrap(), None);
        gateway
            .set_status(404, SubscriptionStatus::Active)
            .await
            .unwrap();
        assert_eq!(gateway.get(404).await.unwrap(), None);
    }
}
