//! # PostgreSQL Store
//!
//! Durable [`TaskStore`] + [`ServerRegistry`] over the schema in `migrations/`.
//!
//! - Claiming is one `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)` so
//!   concurrent schedulers (in this process or others) never receive the same row.
//! - Task writes compare `version` in the `WHERE` clause; zero affected rows means
//!   the task moved under us (`StaleWrite`) or vanished (`TaskNotFound`).
//! - The partial unique index on `subscription_id` backs the one-active-task rule;
//!   a violation surfaces as `DuplicateActiveTask`.
//! - Timestamps (`updated_at`, `backoff_until`, windows, grace periods) use the
//!   database clock so every scheduler agrees on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ServerRegistry, TaskStore};
use crate::constants::messages;
use crate::error::{ProvisionerError, ProvisionerResult};
use crate::models::{
    NewServer, NewTaskTransition, ProvisioningTask, Server, TaskTransition, TaskUpdate,
};
use crate::state_machine::{TaskEvent, TaskStateMachine, TaskStatus};

const TASK_COLUMNS: &str = "id, subscription_id, status, step, attempts, max_retries, payload, \
     error_message, server_id, version, backoff_until, claimed_by, cleared_at, created_at, updated_at";

const SERVER_COLUMNS: &str =
    "id, name, hostname, control_panel_kind, max_accounts, current_accounts, status";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Distinguish a lost optimistic race from a missing row
    async fn classify_missed_write(
        &self,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerError {
        match self.get(task_id).await {
            Ok(_) => ProvisionerError::StaleWrite {
                task_id,
                expected_version,
            },
            Err(e) => e,
        }
    }
}

/// Map a unique-index violation on insert/update to the duplicate-task error
fn duplicate_or(err: sqlx::Error, subscription_id: i64) -> ProvisionerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ProvisionerError::DuplicateActiveTask { subscription_id }
        }
        _ => err.into(),
    }
}

/// Write every mutable field of `update` if the version still matches
async fn write_update(
    conn: &mut PgConnection,
    task_id: i64,
    expected_version: i64,
    update: &TaskUpdate,
) -> Result<Option<TaskRow>, sqlx::Error> {
    let query = format!(
        "UPDATE provisioning_tasks \
         SET status = $3, step = $4, error_message = $5, attempts = $6, payload = $7, \
             server_id = $8, \
             backoff_until = CASE WHEN $9::float8 IS NULL THEN NULL \
                                  ELSE now() + make_interval(secs => $9::float8) END, \
             claimed_by = $10, version = version + 1, updated_at = now() \
         WHERE id = $1 AND version = $2 \
         RETURNING {TASK_COLUMNS}"
    );

    sqlx::query_as::<_, TaskRow>(&query)
        .bind(task_id)
        .bind(expected_version)
        .bind(update.status.as_str())
        .bind(&update.step)
        .bind(&update.error_message)
        .bind(update.attempts)
        .bind(&update.payload)
        .bind(update.server_id)
        .bind(update.backoff.map(|d| d.as_secs_f64()))
        .bind(&update.claimed_by)
        .fetch_optional(&mut *conn)
        .await
}

#[async_trait]
impl TaskStore for PgStore {
    #[instrument(skip(self, payload))]
    async fn create(
        &self,
        subscription_id: i64,
        payload: Value,
        max_retries: i32,
    ) -> ProvisionerResult<ProvisioningTask> {
        let query = format!(
            "INSERT INTO provisioning_tasks (subscription_id, payload, max_retries) \
             VALUES ($1, $2, $3) RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(subscription_id)
            .bind(&payload)
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| duplicate_or(e, subscription_id))?;

        row.try_into()
    }

    async fn get(&self, task_id: i64) -> ProvisionerResult<ProvisioningTask> {
        let query = format!("SELECT {TASK_COLUMNS} FROM provisioning_tasks WHERE id = $1");

        sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ProvisionerError::TaskNotFound(task_id))?
            .try_into()
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_status(
        &self,
        task_id: i64,
        expected_version: i64,
        update: TaskUpdate,
    ) -> ProvisionerResult<ProvisioningTask> {
        let mut conn = self.pool.acquire().await?;
        let written = match write_update(&mut *conn, task_id, expected_version, &update).await {
            Ok(row) => row,
            Err(e) => {
                let subscription_id = self.get(task_id).await?.subscription_id;
                return Err(duplicate_or(e, subscription_id));
            }
        };

        match written {
            Some(row) => row.try_into(),
            None => Err(self.classify_missed_write(task_id, expected_version).await),
        }
    }

    async fn list_by_status(
        &self,
        status: Option<TaskStatus>,
        window: Option<Duration>,
    ) -> ProvisionerResult<Vec<ProvisioningTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM provisioning_tasks \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::float8 IS NULL OR updated_at >= now() - make_interval(secs => $2::float8)) \
             ORDER BY updated_at DESC, id DESC"
        );

        sqlx::query_as::<_, TaskRow>(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(window.map(|w| w.as_secs_f64()))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim_next_pending(
        &self,
        worker_id: &str,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        // Same effect as the Claim transition: attempts + 1, claimed_by set
        let query = format!(
            "UPDATE provisioning_tasks \
             SET status = 'processing', attempts = attempts + 1, claimed_by = $1, \
                 backoff_until = NULL, version = version + 1, updated_at = now() \
             WHERE id = ( \
                 SELECT id FROM provisioning_tasks \
                 WHERE status = 'pending' \
                   AND (backoff_until IS NULL OR backoff_until <= now()) \
                 ORDER BY created_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        );

        let claimed = sqlx::query_as::<_, TaskRow>(&query)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        match claimed {
            Some(row) => {
                let task: ProvisioningTask = row.try_into()?;
                debug!(task_id = task.id, attempts = task.attempts, "Claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn find_active_for_subscription(
        &self,
        subscription_id: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM provisioning_tasks \
             WHERE subscription_id = $1 AND status IN ('pending', 'processing')"
        );

        sqlx::query_as::<_, TaskRow>(&query)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn recover_stale_claims(
        &self,
        grace: Duration,
    ) -> ProvisionerResult<Vec<ProvisioningTask>> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {TASK_COLUMNS} FROM provisioning_tasks \
             WHERE status = 'processing' \
               AND updated_at <= now() - make_interval(secs => $1::float8) \
             ORDER BY id \
             FOR UPDATE SKIP LOCKED"
        );
        let stale: Vec<TaskRow> = sqlx::query_as(&query)
            .bind(grace.as_secs_f64())
            .fetch_all(&mut *tx)
            .await?;

        let mut recovered = Vec::with_capacity(stale.len());
        for row in stale {
            let task: ProvisioningTask = row.try_into()?;
            let update = if task.retries_exhausted() {
                let mut update = TaskStateMachine::apply(
                    &task,
                    &TaskEvent::fail_with_error(messages::ABANDONED),
                )?;
                if let Some(server_id) = update.server_id.take() {
                    sqlx::query(
                        "UPDATE servers SET current_accounts = GREATEST(current_accounts - 1, 0), \
                         updated_at = now() WHERE id = $1",
                    )
                    .bind(server_id)
                    .execute(&mut *tx)
                    .await?;
                }
                update
            } else {
                TaskStateMachine::apply(&task, &TaskEvent::RecoverStale)?
            };

            warn!(
                task_id = task.id,
                claimed_by = ?task.claimed_by,
                to_status = %update.status,
                "Recovering stale claim"
            );

            if let Some(row) = write_update(&mut *tx, task.id, task.version, &update).await? {
                recovered.push(row.try_into()?);
            }
        }

        tx.commit().await?;
        Ok(recovered)
    }

    async fn list_dead_letters(&self) -> ProvisionerResult<Vec<ProvisioningTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM provisioning_tasks \
             WHERE status = 'failed' AND attempts >= max_retries AND cleared_at IS NULL \
             ORDER BY id"
        );

        sqlx::query_as::<_, TaskRow>(&query)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    async fn mark_cleared(
        &self,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<ProvisioningTask> {
        let query = format!(
            "UPDATE provisioning_tasks \
             SET cleared_at = now(), version = version + 1, updated_at = now() \
             WHERE id = $1 AND version = $2 AND status = 'failed' \
             RETURNING {TASK_COLUMNS}"
        );

        let cleared = sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?;

        match cleared {
            Some(row) => row.try_into(),
            None => {
                let current = self.get(task_id).await?;
                if current.version != expected_version {
                    Err(ProvisionerError::StaleWrite {
                        task_id,
                        expected_version,
                    })
                } else {
                    Err(ProvisionerError::ValidationError(format!(
                        "Task {task_id} is {} and cannot be cleared",
                        current.status
                    )))
                }
            }
        }
    }

    async fn record_transition(&self, transition: NewTaskTransition) -> ProvisionerResult<()> {
        sqlx::query(
            "INSERT INTO provisioning_task_transitions \
             (task_id, from_status, to_status, event, step, actor, detail) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(transition.task_id)
        .bind(transition.from_status.map(|s| s.as_str()))
        .bind(transition.to_status.as_str())
        .bind(&transition.event)
        .bind(&transition.step)
        .bind(&transition.actor)
        .bind(&transition.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transitions(&self, task_id: i64) -> ProvisionerResult<Vec<TaskTransition>> {
        sqlx::query_as::<_, TransitionRow>(
            "SELECT id, task_id, from_status, to_status, event, step, actor, detail, created_at \
             FROM provisioning_task_transitions WHERE task_id = $1 ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn status_counts(&self, window: Duration) -> ProvisionerResult<HashMap<TaskStatus, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM provisioning_tasks \
             WHERE updated_at >= now() - make_interval(secs => $1::float8) \
             GROUP BY status",
        )
        .bind(window.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<TaskStatus, i64> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            counts.insert(parse_status(&status)?, count);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> ProvisionerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ServerRegistry for PgStore {
    #[instrument(skip(self, server), fields(hostname = %server.hostname))]
    async fn register_server(&self, server: NewServer) -> ProvisionerResult<Server> {
        let query = format!(
            "INSERT INTO servers (name, hostname, control_panel_kind, max_accounts, current_accounts, status) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (hostname) DO UPDATE \
             SET name = EXCLUDED.name, control_panel_kind = EXCLUDED.control_panel_kind, \
                 max_accounts = EXCLUDED.max_accounts, status = EXCLUDED.status, updated_at = now() \
             RETURNING {SERVER_COLUMNS}"
        );

        sqlx::query_as::<_, ServerRow>(&query)
            .bind(&server.name)
            .bind(&server.hostname)
            .bind(&server.control_panel_kind)
            .bind(server.max_accounts)
            .bind(server.current_accounts.max(0))
            .bind(server.status.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_into()
    }

    async fn get_server(&self, server_id: i64) -> ProvisionerResult<Server> {
        let query = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1");

        sqlx::query_as::<_, ServerRow>(&query)
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ProvisionerError::ServerNotFound(server_id))?
            .try_into()
    }

    async fn list_servers(&self) -> ProvisionerResult<Vec<Server>> {
        let query = format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY id");

        sqlx::query_as::<_, ServerRow>(&query)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(TryInto::try_into)
            .collect()
    }

    #[instrument(skip(self))]
    async fn reserve_server(
        &self,
        server_id: i64,
        task_id: i64,
        expected_version: i64,
    ) -> ProvisionerResult<Option<ProvisioningTask>> {
        let mut tx = self.pool.begin().await?;

        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM provisioning_tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        match version {
            None => return Err(ProvisionerError::TaskNotFound(task_id)),
            Some((current,)) if current != expected_version => {
                return Err(ProvisionerError::StaleWrite {
                    task_id,
                    expected_version,
                })
            }
            Some(_) => {}
        }

        let slot: Option<(i64,)> = sqlx::query_as(
            "UPDATE servers SET current_accounts = current_accounts + 1, updated_at = now() \
             WHERE id = $1 AND status = 'active' AND current_accounts < max_accounts \
             RETURNING id",
        )
        .bind(server_id)
        .fetch_optional(&mut *tx)
        .await?;

        if slot.is_none() {
            tx.rollback().await?;
            // Surface a missing server instead of reporting it as full
            self.get_server(server_id).await?;
            return Ok(None);
        }

        let query = format!(
            "UPDATE provisioning_tasks \
             SET server_id = $2, version = version + 1, updated_at = now() \
             WHERE id = $1 RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id)
            .bind(server_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        row.try_into().map(Some)
    }

    async fn release_server(&self, server_id: i64) -> ProvisionerResult<Server> {
        let query = format!(
            "UPDATE servers SET current_accounts = GREATEST(current_accounts - 1, 0), \
             updated_at = now() WHERE id = $1 RETURNING {SERVER_COLUMNS}"
        );

        sqlx::query_as::<_, ServerRow>(&query)
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ProvisionerError::ServerNotFound(server_id))?
            .try_into()
    }
}

fn parse_status(raw: &str) -> ProvisionerResult<TaskStatus> {
    raw.parse().map_err(ProvisionerError::DatabaseError)
}

/// Internal struct for task rows
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    subscription_id: i64,
    status: String,
    step: Option<String>,
    attempts: i32,
    max_retries: i32,
    payload: Value,
    error_message: Option<String>,
    server_id: Option<i64>,
    version: i64,
    backoff_until: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    cleared_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for ProvisioningTask {
    type Error = ProvisionerError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(ProvisioningTask {
            id: row.id,
            subscription_id: row.subscription_id,
            status: parse_status(&row.status)?,
            step: row.step,
            attempts: row.attempts,
            max_retries: row.max_retries,
            payload: row.payload,
            error_message: row.error_message,
            server_id: row.server_id,
            version: row.version,
            backoff_until: row.backoff_until,
            claimed_by: row.claimed_by,
            cleared_at: row.cleared_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ServerRow {
    id: i64,
    name: String,
    hostname: String,
    control_panel_kind: String,
    max_accounts: i32,
    current_accounts: i32,
    status: String,
}

impl TryFrom<ServerRow> for Server {
    type Error = ProvisionerError;

    fn try_from(row: ServerRow) -> Result<Self, Self::Error> {
        Ok(Server {
            id: row.id,
            name: row.name,
            hostname: row.hostname,
            control_panel_kind: row.control_panel_kind,
            max_accounts: row.max_accounts,
            current_accounts: row.current_accounts,
            status: row.status.parse().map_err(ProvisionerError::DatabaseError)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: i64,
    task_id: i64,
    from_status: Option<String>,
    to_status: String,
    event: String,
    step: Option<String>,
    actor: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for TaskTransition {
    type Error = ProvisionerError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        Ok(TaskTransition {
            id: row.id,
            task_id: row.task_id,
            from_status: row.from_status.as_deref().map(parse_status).transpose()?,
            to_status: parse_status(&row.to_status)?,
            event: row.event,
            step: row.step,
            actor: row.actor,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}
