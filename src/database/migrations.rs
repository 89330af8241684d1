//! # Database Migrations
//!
//! Schema migrations embedded from the crate's `migrations/` directory
//! (`YYYYMMDDHHMMSS_description.sql`). sqlx tracks applied versions in
//! `_sqlx_migrations` and serializes concurrent runners with an advisory lock.

use sqlx::PgPool;
use tracing::info;

use crate::error::{ProvisionerError, ProvisionerResult};

pub async fn run_migrations(pool: &PgPool) -> ProvisionerResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| ProvisionerError::DatabaseError(format!("Migration failed: {e}")))?;

    info!("Database migrations applied");
    Ok(())
}
