//! # Server Allocator
//!
//! Chooses the fleet member that will host a task's resources and takes one
//! account slot on it.
//!
//! Policy: among active servers with a free slot, lowest
//! `current_accounts / max_accounts`, ties broken by lowest id. The choice is made
//! on a snapshot of the fleet; the reservation itself is a conditional store update,
//! so when another worker fills the chosen server first the allocator re-reads the
//! fleet and tries again a bounded number of times.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::constants::system;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::logging::log_fleet_operation;
use crate::models::{ProvisioningTask, Server};
use crate::store::ServerRegistry;

pub struct ServerAllocator {
    registry: Arc<dyn ServerRegistry>,
    race_retries: usize,
}

impl ServerAllocator {
    pub fn new(registry: Arc<dyn ServerRegistry>) -> Self {
        Self {
            registry,
            race_retries: system::ALLOCATION_RACE_RETRIES,
        }
    }

    /// Least-loaded server with spare capacity in `servers`
    pub fn select(servers: &[Server]) -> Option<&Server> {
        servers
            .iter()
            .filter(|s| s.has_capacity())
            .min_by(|a, b| {
                a.load_ratio()
                    .partial_cmp(&b.load_ratio())
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            })
    }

    /// Reserve a server for `task` and return the task as written by the store.
    ///
    /// A task that already holds a server is returned unchanged.
    #[instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn allocate(&self, task: &ProvisioningTask) -> ProvisionerResult<ProvisioningTask> {
        if task.server_id.is_some() {
            debug!(server_id = ?task.server_id, "Task already holds a server");
            return Ok(task.clone());
        }

        for attempt in 0..=self.race_retries {
            let servers = self.registry.list_servers().await?;
            let Some(candidate) = Self::select(&servers) else {
                log_fleet_operation("allocate", None, Some(task.id), "no_capacity", None);
                return Err(ProvisionerError::NoCapacity);
            };

            match self
                .registry
                .reserve_server(candidate.id, task.id, task.version)
                .await?
            {
                Some(updated) => {
                    log_fleet_operation(
                        "allocate",
                        Some(candidate.id),
                        Some(task.id),
                        "reserved",
                        Some(&candidate.hostname),
                    );
                    return Ok(updated);
                }
                None => {
                    debug!(
                        server_id = candidate.id,
                        attempt, "Server filled before reservation, re-reading fleet"
                    );
                }
            }
        }

        warn!(
            task_id = task.id,
            retries = self.race_retries,
            "Allocation kept losing reservation races"
        );
        Err(ProvisionerError::NoCapacity)
    }

    /// Give a slot back; never drops below zero
    pub async fn release(&self, server_id: i64, task_id: Option<i64>) -> ProvisionerResult<Server> {
        let server = self.registry.release_server(server_id).await?;
        log_fleet_operation(
            "release",
            Some(server_id),
            task_id,
            "released",
            Some(&format!(
                "{}/{} accounts in use",
                server.current_accounts, server.max_accounts
            )),
        );
        Ok(server)
    }
}
