//! # Schema Migrations
//!
//! The lead store schema ships inside the binary and is brought up to date
//! when a `Database` opens.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  migrations/sqlite/                                                     │
//! │    001_leads.sql   leads (tenant_id, lead_id) + tenant_sync_state       │
//! │                                                                         │
//! │  Database::new ──► MIGRATOR.run(pool)                                   │
//! │                      • skips versions already in _sqlx_migrations       │
//! │                      • applies the rest in version order                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! New schema changes get a new numbered file; applied files are never
//! edited, their checksums are verified on every start.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Applies every migration the database has not seen yet.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    debug!(embedded = MIGRATOR.migrations.len(), "Applying lead store migrations");
    MIGRATOR.run(pool).await?;
    info!("Lead store schema is current");
    Ok(())
}

/// (embedded, applied) migration counts.
///
/// A database that was never migrated reports zero applied.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let embedded = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((embedded, applied.max(0) as usize))
}
