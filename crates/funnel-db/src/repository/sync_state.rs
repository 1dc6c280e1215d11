//! # Sync State Repository
//!
//! One row per tenant holding the latest sync report and timestamps.
//!
//! ```text
//! tenant_sync_state
//! ┌───────────┬────────────────┬───────────────────┬──────────────────┐
//! │ tenant_id │ last_synced_at │ last_full_sync_at │ last_report      │
//! ├───────────┼────────────────┼───────────────────┼──────────────────┤
//! │ acme      │ 2024-05-01T…   │ 2024-05-01T…      │ {"created":3,…}  │
//! └───────────┴────────────────┴───────────────────┴──────────────────┘
//! ```
//!
//! `last_full_sync_at` only moves on full syncs; incremental syncs keep the
//! previous value.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use funnel_core::SyncReport;

/// Repository for per-tenant sync bookkeeping.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    /// Records a finished sync for the tenant.
    pub async fn record(&self, tenant_id: &str, report: &SyncReport) -> DbResult<()> {
        let now = Utc::now();
        let full_at = report.full_sync.then_some(now);
        let payload = serde_json::to_string(report)?;

        sqlx::query(
            r#"
            INSERT INTO tenant_sync_state (tenant_id, last_synced_at, last_full_sync_at, last_report)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                last_full_sync_at = COALESCE(excluded.last_full_sync_at, tenant_sync_state.last_full_sync_at),
                last_report = excluded.last_report
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .bind(full_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        debug!(tenant_id = %tenant_id, full_sync = report.full_sync, "Sync state recorded");
        Ok(())
    }

    /// When the tenant last completed any sync.
    pub async fn last_synced_at(&self, tenant_id: &str) -> DbResult<Option<DateTime<Utc>>> {
        let value: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT last_synced_at FROM tenant_sync_state WHERE tenant_id = ?1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    /// When the tenant last completed a full sync.
    pub async fn last_full_sync_at(&self, tenant_id: &str) -> DbResult<Option<DateTime<Utc>>> {
        let value: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT last_full_sync_at FROM tenant_sync_state WHERE tenant_id = ?1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    /// The most recent report, if the tenant ever synced.
    pub async fn last_report(&self, tenant_id: &str) -> DbResult<Option<SyncReport>> {
        let value: Option<Option<String>> = sqlx::query_scalar(
            "SELECT last_report FROM tenant_sync_state WHERE tenant_id = ?1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match value.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
