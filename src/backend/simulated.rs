//! In-memory hosting backend with fault injection.
//!
//! Resources live in `DashMap`s keyed by their natural identifiers and remember the
//! owning subscription: a second request from the same subscription is a no-op,
//! one from a different subscription is a [`BackendError::Conflict`].
//!
//! Faults are scripted per operation name (`"create_vhost"`, `"acme_validate"`, ...)
//! and consumed one per call, so a test can say "fail twice with a timeout, then
//! succeed".

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::{
    AcmeOrder, BackendError, BackendResult, BackupSpec, DatabaseSpec, HostingBackend,
    Http01Challenge, IssuedCertificate, MailboxSpec, OrderStatus, ResourceHandle, VhostSpec,
};
use crate::models::Server;

/// Scripted faults for one operation
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    queue: VecDeque<BackendError>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with `error`
    pub fn fail(mut self, times: usize, error: BackendError) -> Self {
        self.queue.extend(std::iter::repeat(error).take(times));
        self
    }
}

#[derive(Debug, Clone)]
struct Owned {
    subscription_id: i64,
    server_id: Option<i64>,
    resource_id: String,
}

#[derive(Debug, Clone)]
struct OrderRecord {
    domain: String,
    status: OrderStatus,
    challenge: Http01Challenge,
    published: bool,
    certificate: Option<IssuedCertificate>,
}

#[derive(Debug, Default)]
pub struct SimulatedBackend {
    vhosts: DashMap<String, Owned>,
    databases: DashMap<String, Owned>,
    mailboxes: DashMap<String, Owned>,
    backups: DashMap<i64, Owned>,
    orders: DashMap<String, OrderRecord>,
    installed: DashMap<String, (i64, String)>,
    faults: DashMap<String, FaultPlan>,
    calls: DashMap<String, u64>,
    sequence: AtomicU64,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script faults for `operation`, replacing any earlier plan
    pub fn inject(&self, operation: &str, plan: FaultPlan) {
        self.faults.insert(operation.to_string(), plan);
    }

    /// Calls made to `operation`, including failed ones
    pub fn call_count(&self, operation: &str) -> u64 {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn has_vhost(&self, domain: &str) -> bool {
        self.vhosts.contains_key(domain)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.contains_key(name)
    }

    pub fn has_mailbox(&self, address: &str) -> bool {
        self.mailboxes.contains_key(address)
    }

    pub fn has_backup_schedule(&self, subscription_id: i64) -> bool {
        self.backups.contains_key(&subscription_id)
    }

    /// Serial of the certificate installed for `domain`
    pub fn installed_certificate(&self, domain: &str) -> Option<String> {
        self.installed.get(domain).map(|entry| entry.1.clone())
    }

    fn enter(&self, operation: &str) -> BackendResult<()> {
        *self.calls.entry(operation.to_string()).or_insert(0) += 1;
        if let Some(mut plan) = self.faults.get_mut(operation) {
            if let Some(error) = plan.queue.pop_front() {
                debug!(operation, %error, "Injected backend fault");
                return Err(error);
            }
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn claim(
        &self,
        table: &DashMap<String, Owned>,
        key: &str,
        subscription_id: i64,
        server_id: Option<i64>,
        prefix: &str,
    ) -> BackendResult<ResourceHandle> {
        let entry = table.entry(key.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let owned = existing.get();
                if owned.subscription_id != subscription_id {
                    return Err(BackendError::Conflict(format!(
                        "{key} belongs to another subscription"
                    )));
                }
                Ok(ResourceHandle {
                    resource_id: owned.resource_id.clone(),
                    created: false,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let resource_id = self.next_id(prefix);
                slot.insert(Owned {
                    subscription_id,
                    server_id,
                    resource_id: resource_id.clone(),
                });
                Ok(ResourceHandle {
                    resource_id,
                    created: true,
                })
            }
        }
    }

    /// Server a vhost was created on, used to check certificate placement
    fn vhost_server(&self, domain: &str) -> Option<i64> {
        self.vhosts.get(domain).and_then(|v| v.server_id)
    }
}

fn validate_name(kind: &str, value: &str) -> BackendResult<()> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(BackendError::Invalid(format!("{kind} '{value}' is not valid")));
    }
    Ok(())
}

#[async_trait]
impl HostingBackend for SimulatedBackend {
    async fn create_vhost(&self, server: &Server, spec: &VhostSpec) -> BackendResult<ResourceHandle> {
        self.enter("create_vhost")?;
        validate_name("domain", &spec.domain)?;
        self.claim(
            &self.vhosts,
            &spec.domain,
            spec.subscription_id,
            Some(server.id),
            "vhost",
        )
    }

    async fn create_database(
        &self,
        server: &Server,
        spec: &DatabaseSpec,
    ) -> BackendResult<ResourceHandle> {
        self.enter("create_database")?;
        validate_name("database", &spec.name)?;
        validate_name("database user", &spec.user)?;
        self.claim(
            &self.databases,
            &spec.name,
            spec.subscription_id,
            Some(server.id),
            "db",
        )
    }

    async fn create_mailbox(&self, spec: &MailboxSpec) -> BackendResult<ResourceHandle> {
        self.enter("create_mailbox")?;
        if !spec.address.contains('@') {
            return Err(BackendError::Invalid(format!(
                "mailbox address '{}' has no domain",
                spec.address
            )));
        }
        self.claim(
            &self.mailboxes,
            &spec.address,
            spec.subscription_id,
            None,
            "mbx",
        )
    }

    async fn acme_new_order(&self, domain: &str) -> BackendResult<AcmeOrder> {
        self.enter("acme_new_order")?;
        validate_name("domain", domain)?;

        if let Some(existing) = self
            .orders
            .iter()
            .find(|o| o.domain == domain && o.status != OrderStatus::Invalid)
        {
            return Ok(AcmeOrder {
                order_id: existing.key().clone(),
                domain: domain.to_string(),
                status: existing.status,
            });
        }

        let order_id = self.next_id("order");
        let token = self.next_id("token");
        let record = OrderRecord {
            domain: domain.to_string(),
            status: OrderStatus::Pending,
            challenge: Http01Challenge {
                key_authorization: format!("{token}.thumbprint"),
                token,
            },
            published: false,
            certificate: None,
        };
        self.orders.insert(order_id.clone(), record);
        Ok(AcmeOrder {
            order_id,
            domain: domain.to_string(),
            status: OrderStatus::Pending,
        })
    }

    async fn acme_http01_challenge(&self, order_id: &str) -> BackendResult<Http01Challenge> {
        self.enter("acme_http01_challenge")?;
        self.orders
            .get(order_id)
            .map(|o| o.challenge.clone())
            .ok_or_else(|| BackendError::Invalid(format!("unknown order {order_id}")))
    }

    async fn publish_challenge(
        &self,
        server: &Server,
        domain: &str,
        challenge: &Http01Challenge,
    ) -> BackendResult<()> {
        self.enter("publish_challenge")?;
        if self.vhost_server(domain) != Some(server.id) {
            return Err(BackendError::Invalid(format!(
                "{domain} is not served by {}",
                server.hostname
            )));
        }
        for mut order in self.orders.iter_mut() {
            if order.domain == domain && order.challenge.token == challenge.token {
                order.published = true;
            }
        }
        Ok(())
    }

    async fn acme_validate(&self, order_id: &str) -> BackendResult<OrderStatus> {
        self.enter("acme_validate")?;
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BackendError::Invalid(format!("unknown order {order_id}")))?;
        if order.status == OrderStatus::Pending {
            order.status = if order.published {
                OrderStatus::Ready
            } else {
                OrderStatus::Invalid
            };
        }
        Ok(order.status)
    }

    async fn acme_finalize(&self, order_id: &str) -> BackendResult<IssuedCertificate> {
        self.enter("acme_finalize")?;
        let mut order = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BackendError::Invalid(format!("unknown order {order_id}")))?;
        if let Some(certificate) = &order.certificate {
            return Ok(certificate.clone());
        }
        if order.status != OrderStatus::Ready {
            return Err(BackendError::Invalid(format!(
                "order {order_id} is not ready for finalization"
            )));
        }

        let certificate = IssuedCertificate {
            serial: self.next_id("serial"),
            domain: order.domain.clone(),
            not_after: Utc::now() + chrono::Duration::days(90),
        };
        order.status = OrderStatus::Valid;
        order.certificate = Some(certificate.clone());
        Ok(certificate)
    }

    async fn install_certificate(
        &self,
        server: &Server,
        certificate: &IssuedCertificate,
    ) -> BackendResult<()> {
        self.enter("install_certificate")?;
        self.installed.insert(
            certificate.domain.clone(),
            (server.id, certificate.serial.clone()),
        );
        Ok(())
    }

    async fn schedule_backup(&self, server: &Server, spec: &BackupSpec) -> BackendResult<ResourceHandle> {
        self.enter("schedule_backup")?;
        if spec.cron.split_whitespace().count() != 5 {
            return Err(BackendError::Invalid(format!(
                "backup schedule '{}' is not a five-field cron expression",
                spec.cron
            )));
        }
        if let Some(existing) = self.backups.get(&spec.subscription_id) {
            return Ok(ResourceHandle {
                resource_id: existing.resource_id.clone(),
                created: false,
            });
        }
        let resource_id = self.next_id("backup");
        self.backups.insert(
            spec.subscription_id,
            Owned {
                subscription_id: spec.subscription_id,
                server_id: Some(server.id),
                resource_id: resource_id.clone(),
            },
        );
        Ok(ResourceHandle {
            resource_id,
            created: true,
        })
    }
}
