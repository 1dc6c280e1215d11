//! # Lead Repository
//!
//! Idempotent storage of CRM leads, full-sync soft deletes and the filtered
//! listing used by the HTTP surface.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      sync(tenant, leads, is_full)                       │
//! │                                                                         │
//! │  leads ──► validate_lead ──✗──► errors += 1 (never written)            │
//! │              │                                                          │
//! │              ▼                                                          │
//! │  fold duplicate ids (newest updated_at wins, others → stale)           │
//! │              │                                                          │
//! │              ▼                                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  chunk of batch_size, ONE TRANSACTION                           │   │
//! │  │                                                                 │   │
//! │  │  INSERT ... ON CONFLICT(tenant_id, lead_id) DO UPDATE          │   │
//! │  │     WHERE excluded.updated_at >= leads.updated_at              │   │
//! │  │  RETURNING insert_token                                        │   │
//! │  │                                                                 │   │
//! │  │  token == ours  → created                                      │   │
//! │  │  token != ours  → updated                                      │   │
//! │  │  no row         → stale (stored copy is newer)                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │              │ batch failed?                                            │
//! │              ▼                                                          │
//! │  ROLLBACK, then one write per lead:                                    │
//! │     UNIQUE violation → plain UPDATE ... WHERE updated_at <= ?          │
//! │     anything else    → errors += 1                                     │
//! │              │                                                          │
//! │              ▼ is_full                                                  │
//! │  [tenant lock] UPDATE leads SET is_deleted = 1                         │
//! │     WHERE lead_id NOT IN (fetched ids) AND not already deleted         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Read Path
//! Listings never return soft-deleted rows. `total` counts the filtered,
//! active rows; `total_including_deleted` counts every row of the tenant.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::locks::TenantLocks;
use crate::repository::sync_state::SyncStateRepository;
use crate::DEFAULT_BATCH_SIZE;
use funnel_core::validation::validate_lead;
use funnel_core::{Lead, LeadQuery, LeadQueryPage, LeadTally, StoredLead, SyncReport, Tag};

const LEAD_COLUMNS: &str = "tenant_id, lead_id, name, price, responsible_user_id, \
     pipeline_id, status_id, is_deleted, created_at, updated_at, closed_at, \
     custom_fields, tags, synced_at, last_modified_at";

// =============================================================================
// Row Mapping
// =============================================================================

/// Raw `leads` row. JSON columns are still text here.
#[derive(Debug, FromRow)]
struct LeadRow {
    tenant_id: String,
    lead_id: i64,
    name: Option<String>,
    price: Option<i64>,
    responsible_user_id: Option<i64>,
    pipeline_id: i64,
    status_id: i64,
    is_deleted: Option<bool>,
    created_at: i64,
    updated_at: i64,
    closed_at: Option<i64>,
    custom_fields: String,
    tags: String,
    synced_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
}

impl TryFrom<LeadRow> for StoredLead {
    type Error = DbError;

    fn try_from(row: LeadRow) -> DbResult<Self> {
        let custom_fields: serde_json::Value = serde_json::from_str(&row.custom_fields)?;
        let tags: Vec<Tag> = serde_json::from_str(&row.tags)?;

        Ok(StoredLead {
            lead: Lead {
                id: Some(row.lead_id),
                name: row.name,
                price: row.price,
                responsible_user_id: row.responsible_user_id,
                pipeline_id: row.pipeline_id,
                status_id: row.status_id,
                is_deleted: row.is_deleted,
                created_at: row.created_at,
                updated_at: row.updated_at,
                closed_at: row.closed_at,
                custom_fields,
                tags,
            },
            tenant_id: row.tenant_id,
            synced_at: row.synced_at,
            last_modified_at: row.last_modified_at,
        })
    }
}

/// Outcome of writing a single lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    /// The stored copy has a newer `updated_at`.
    Stale,
}

fn record_outcome(report: &mut SyncReport, outcome: WriteOutcome) {
    match outcome {
        WriteOutcome::Created => report.created += 1,
        WriteOutcome::Updated => report.updated += 1,
        WriteOutcome::Stale => report.stale += 1,
    }
}

fn modified_at(updated_at: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(updated_at, 0).unwrap_or_default()
}

// =============================================================================
// Single-Row Writes
// =============================================================================

/// Upserts one lead. Works on the pool or inside a transaction.
async fn upsert_lead<'e, E>(
    executor: E,
    tenant_id: &str,
    lead_id: i64,
    lead: &Lead,
    now: DateTime<Utc>,
) -> DbResult<WriteOutcome>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let token = Uuid::new_v4().to_string();
    let custom_fields = serde_json::to_string(&lead.custom_fields)?;
    let tags = serde_json::to_string(&lead.tags)?;

    // insert_token is deliberately left out of the UPDATE arm.
    let returned: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO leads (
            tenant_id, lead_id, name, price, responsible_user_id,
            pipeline_id, status_id, is_deleted, created_at, updated_at,
            closed_at, custom_fields, tags, synced_at, last_modified_at,
            insert_token
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15,
            ?16
        )
        ON CONFLICT (tenant_id, lead_id) WHERE lead_id IS NOT NULL DO UPDATE SET
            name = excluded.name,
            price = excluded.price,
            responsible_user_id = excluded.responsible_user_id,
            pipeline_id = excluded.pipeline_id,
            status_id = excluded.status_id,
            is_deleted = excluded.is_deleted,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            closed_at = excluded.closed_at,
            custom_fields = excluded.custom_fields,
            tags = excluded.tags,
            synced_at = excluded.synced_at,
            last_modified_at = excluded.last_modified_at
        WHERE excluded.updated_at >= leads.updated_at
        RETURNING insert_token
        "#,
    )
    .bind(tenant_id)
    .bind(lead_id)
    .bind(&lead.name)
    .bind(lead.price)
    .bind(lead.responsible_user_id)
    .bind(lead.pipeline_id)
    .bind(lead.status_id)
    .bind(lead.is_deleted)
    .bind(lead.created_at)
    .bind(lead.updated_at)
    .bind(lead.closed_at)
    .bind(custom_fields)
    .bind(tags)
    .bind(now)
    .bind(modified_at(lead.updated_at))
    .bind(&token)
    .fetch_optional(executor)
    .await?;

    Ok(match returned {
        Some(t) if t == token => WriteOutcome::Created,
        Some(_) => WriteOutcome::Updated,
        None => WriteOutcome::Stale,
    })
}

/// Plain update used when an upsert reports a unique violation.
async fn update_lead(
    pool: &SqlitePool,
    tenant_id: &str,
    lead_id: i64,
    lead: &Lead,
    now: DateTime<Utc>,
) -> DbResult<WriteOutcome> {
    let custom_fields = serde_json::to_string(&lead.custom_fields)?;
    let tags = serde_json::to_string(&lead.tags)?;

    let result = sqlx::query(
        r#"
        UPDATE leads SET
            name = ?3,
            price = ?4,
            responsible_user_id = ?5,
            pipeline_id = ?6,
            status_id = ?7,
            is_deleted = ?8,
            created_at = ?9,
            updated_at = ?10,
            closed_at = ?11,
            custom_fields = ?12,
            tags = ?13,
            synced_at = ?14,
            last_modified_at = ?15
        WHERE tenant_id = ?1 AND lead_id = ?2 AND updated_at <= ?10
        "#,
    )
    .bind(tenant_id)
    .bind(lead_id)
    .bind(&lead.name)
    .bind(lead.price)
    .bind(lead.responsible_user_id)
    .bind(lead.pipeline_id)
    .bind(lead.status_id)
    .bind(lead.is_deleted)
    .bind(lead.created_at)
    .bind(lead.updated_at)
    .bind(lead.closed_at)
    .bind(custom_fields)
    .bind(tags)
    .bind(now)
    .bind(modified_at(lead.updated_at))
    .execute(pool)
    .await?;

    Ok(if result.rows_affected() > 0 {
        WriteOutcome::Updated
    } else {
        WriteOutcome::Stale
    })
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for tenant-scoped lead storage.
#[derive(Debug, Clone)]
pub struct LeadRepository {
    pool: SqlitePool,
    batch_size: usize,
    locks: TenantLocks,
}

impl LeadRepository {
    /// Creates a new LeadRepository with its own lock table.
    ///
    /// Prefer [`crate::Database::leads`], which shares locks across handles.
    pub fn new(pool: SqlitePool) -> Self {
        LeadRepository {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
            locks: TenantLocks::new(),
        }
    }

    /// Sets the number of leads written per transaction (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Shares an existing per-tenant lock table.
    pub fn with_locks(mut self, locks: TenantLocks) -> Self {
        self.locks = locks;
        self
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Stores a fetched lead set and records the outcome for the tenant.
    ///
    /// With `is_full_sync`, leads of the tenant missing from `leads` are
    /// soft-deleted afterwards. Only pass `true` for a complete fetch.
    ///
    /// ## Returns
    /// The [`SyncReport`] for this call. Per-lead failures are counted in
    /// `errors`; only failures that prevent any write return `Err`.
    pub async fn sync(
        &self,
        tenant_id: &str,
        leads: &[Lead],
        is_full_sync: bool,
    ) -> DbResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(is_full_sync);

        info!(
            tenant_id = %tenant_id,
            leads = leads.len(),
            full_sync = is_full_sync,
            "Storing lead set"
        );

        // Hold the tenant lock for the whole full sync so the fetched-id
        // set and the rows written agree when reconciliation runs.
        let _guard = if is_full_sync {
            Some(self.locks.acquire(tenant_id).await)
        } else {
            None
        };

        let valid = self.write_all(tenant_id, leads, &mut report).await?;

        if is_full_sync {
            let ids: Vec<i64> = valid.iter().map(|(id, _)| *id).collect();
            report.soft_deleted = self.reconcile_deletions(tenant_id, &ids).await?;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;

        SyncStateRepository::new(self.pool.clone())
            .record(tenant_id, &report)
            .await?;

        info!(
            tenant_id = %tenant_id,
            created = report.created,
            updated = report.updated,
            stale = report.stale,
            soft_deleted = report.soft_deleted,
            errors = report.errors,
            elapsed_ms = report.elapsed_ms,
            "Lead set stored"
        );

        Ok(report)
    }

    /// Writes leads without reconciliation or sync-state bookkeeping.
    ///
    /// Used for webhook deliveries, which must not move `last_synced_at`.
    pub async fn apply(&self, tenant_id: &str, leads: &[Lead]) -> DbResult<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::new(false);
        self.write_all(tenant_id, leads, &mut report).await?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Validates, folds and writes leads. Returns the valid, folded set.
    async fn write_all<'a>(
        &self,
        tenant_id: &str,
        leads: &'a [Lead],
        report: &mut SyncReport,
    ) -> DbResult<Vec<(i64, &'a Lead)>> {
        report.processed += leads.len() as u64;

        let mut folded: Vec<(i64, &Lead)> = Vec::with_capacity(leads.len());
        let mut positions: HashMap<i64, usize> = HashMap::new();

        for lead in leads {
            let id = match validate_lead(lead) {
                Ok(id) => id,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Skipping invalid lead");
                    report.errors += 1;
                    continue;
                }
            };

            match positions.get(&id) {
                Some(&pos) => {
                    report.stale += 1;
                    if lead.updated_at >= folded[pos].1.updated_at {
                        folded[pos].1 = lead;
                    }
                }
                None => {
                    positions.insert(id, folded.len());
                    folded.push((id, lead));
                }
            }
        }

        for chunk in folded.chunks(self.batch_size) {
            self.write_chunk(tenant_id, chunk, report).await?;
        }

        Ok(folded)
    }

    async fn write_chunk(
        &self,
        tenant_id: &str,
        chunk: &[(i64, &Lead)],
        report: &mut SyncReport,
    ) -> DbResult<()> {
        let now = Utc::now();

        match self.write_batch(tenant_id, chunk, now).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    record_outcome(report, outcome);
                }
                Ok(())
            }
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    batch = chunk.len(),
                    error = %e,
                    "Batch write failed, retrying leads individually"
                );
                for (id, lead) in chunk {
                    match self.write_single(tenant_id, *id, lead, now).await {
                        Ok(outcome) => record_outcome(report, outcome),
                        Err(e) => {
                            warn!(
                                tenant_id = %tenant_id,
                                lead_id = id,
                                error = %e,
                                "Lead write failed"
                            );
                            report.errors += 1;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Writes a chunk in one transaction; any failure rolls the chunk back.
    async fn write_batch(
        &self,
        tenant_id: &str,
        chunk: &[(i64, &Lead)],
        now: DateTime<Utc>,
    ) -> DbResult<Vec<WriteOutcome>> {
        let mut tx = self.pool.begin().await?;

        let mut outcomes = Vec::with_capacity(chunk.len());
        for (id, lead) in chunk {
            outcomes.push(upsert_lead(&mut *tx, tenant_id, *id, lead, now).await?);
        }

        tx.commit().await?;

        debug!(tenant_id = %tenant_id, batch = chunk.len(), "Batch committed");
        Ok(outcomes)
    }

    async fn write_single(
        &self,
        tenant_id: &str,
        lead_id: i64,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> DbResult<WriteOutcome> {
        match upsert_lead(&self.pool, tenant_id, lead_id, lead, now).await {
            Err(DbError::UniqueViolation { field, .. }) => {
                debug!(
                    tenant_id = %tenant_id,
                    lead_id,
                    field = %field,
                    "Unique violation, retrying as update"
                );
                update_lead(&self.pool, tenant_id, lead_id, lead, now).await
            }
            other => other,
        }
    }

    /// Soft-deletes the tenant's active leads whose id is not in `seen_ids`.
    async fn reconcile_deletions(&self, tenant_id: &str, seen_ids: &[i64]) -> DbResult<u64> {
        let seen = serde_json::to_string(seen_ids)?;

        let result = sqlx::query(
            r#"
            UPDATE leads SET is_deleted = 1, synced_at = ?1
            WHERE tenant_id = ?2
              AND lead_id IS NOT NULL
              AND (is_deleted IS NULL OR is_deleted = 0)
              AND lead_id NOT IN (SELECT value FROM json_each(?3))
            "#,
        )
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(seen)
        .execute(&self.pool)
        .await?;

        let soft_deleted = result.rows_affected();
        if soft_deleted > 0 {
            info!(tenant_id = %tenant_id, soft_deleted, "Soft-deleted leads missing upstream");
        }
        Ok(soft_deleted)
    }

    /// Soft-deletes specific leads (webhook deletes, leads gone upstream).
    ///
    /// Returns the number of rows that changed.
    pub async fn soft_delete_ids(&self, tenant_id: &str, ids: &[i64]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let _guard = self.locks.acquire(tenant_id).await;
        let ids_json = serde_json::to_string(ids)?;

        let result = sqlx::query(
            r#"
            UPDATE leads SET is_deleted = 1, synced_at = ?1
            WHERE tenant_id = ?2
              AND (is_deleted IS NULL OR is_deleted = 0)
              AND lead_id IN (SELECT value FROM json_each(?3))
            "#,
        )
        .bind(Utc::now())
        .bind(tenant_id)
        .bind(ids_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Lists active leads matching `query`, newest first.
    pub async fn query(&self, tenant_id: &str, query: &LeadQuery) -> DbResult<LeadQueryPage> {
        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM leads");
        push_filters(&mut count_qb, tenant_id, query);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {LEAD_COLUMNS} FROM leads"));
        push_filters(&mut qb, tenant_id, query);
        qb.push(" ORDER BY created_at DESC, lead_id DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);

        let rows: Vec<LeadRow> = qb.build_query_as::<LeadRow>().fetch_all(&self.pool).await?;
        let leads = rows
            .into_iter()
            .map(StoredLead::try_from)
            .collect::<DbResult<Vec<_>>>()?;

        let total_including_deleted = self.count_all(tenant_id).await?;

        debug!(
            tenant_id = %tenant_id,
            returned = leads.len(),
            total,
            "Lead query"
        );

        Ok(LeadQueryPage {
            leads,
            total,
            total_including_deleted,
            page: query.page,
            limit: query.limit,
        })
    }

    /// Gets one stored lead, soft-deleted or not.
    pub async fn get(&self, tenant_id: &str, lead_id: i64) -> DbResult<Option<StoredLead>> {
        let row: Option<LeadRow> = sqlx::query_as(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND lead_id = ?2"
        ))
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredLead::try_from).transpose()
    }

    /// Counts every stored lead of the tenant, soft-deleted included.
    pub async fn count_all(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leads WHERE tenant_id = ?1 AND lead_id IS NOT NULL",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Grouped (pipeline, status, deleted) counts for stats.
    pub async fn funnel_counts(&self, tenant_id: &str) -> DbResult<Vec<LeadTally>> {
        let rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT pipeline_id, status_id,
                   CASE WHEN is_deleted = 1 THEN 1 ELSE 0 END AS deleted,
                   COUNT(*)
            FROM leads
            WHERE tenant_id = ?1 AND lead_id IS NOT NULL
            GROUP BY pipeline_id, status_id, deleted
            ORDER BY pipeline_id, status_id, deleted
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(pipeline_id, status_id, deleted, count)| LeadTally {
                pipeline_id,
                status_id,
                is_deleted: deleted == 1,
                count: count.max(0) as u64,
            })
            .collect())
    }

    /// When the tenant last completed a sync.
    pub async fn last_synced_at(&self, tenant_id: &str) -> DbResult<Option<DateTime<Utc>>> {
        SyncStateRepository::new(self.pool.clone())
            .last_synced_at(tenant_id)
            .await
    }
}

/// Appends the WHERE clause shared by the count and page queries.
fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, tenant_id: &str, query: &LeadQuery) {
    qb.push(" WHERE tenant_id = ")
        .push_bind(tenant_id.to_string())
        .push(" AND lead_id IS NOT NULL AND (is_deleted IS NULL OR is_deleted = 0)");

    let column = query.date_field.column();
    if let Some(from) = query.from {
        qb.push(format!(" AND {column} >= ")).push_bind(from);
    }
    if let Some(to) = query.to {
        qb.push(format!(" AND {column} <= ")).push_bind(to);
    }
    if let Some(owner) = query.responsible_user_id {
        qb.push(" AND responsible_user_id = ").push_bind(owner);
    }
    if let Some(pipeline_id) = query.pipeline_id {
        qb.push(" AND pipeline_id = ").push_bind(pipeline_id);
    }
    if let Some(status_id) = query.status_id {
        qb.push(" AND status_id = ").push_bind(status_id);
    }

    if !query.tags.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM json_each(leads.tags) AS t \
             WHERE json_extract(t.value, '$.name') IN (",
        );
        let mut names = qb.separated(", ");
        for tag in &query.tags {
            names.push_bind(tag.clone());
        }
        names.push_unseparated("))");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use funnel_core::DateField;

    const TENANT: &str = "acme";

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn lead(id: i64, updated_at: i64) -> Lead {
        Lead::new(id, 1, 10)
            .with_updated_at(updated_at)
            .with_created_at(id * 100)
    }

    fn tagged(mut lead: Lead, names: &[&str]) -> Lead {
        lead.tags = names
            .iter()
            .map(|n| Tag {
                id: None,
                name: n.to_string(),
            })
            .collect();
        lead
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let db = setup().await;
        let leads = vec![lead(1, 1000)];

        let first = db.leads().sync(TENANT, &leads, false).await.unwrap();
        assert_eq!((first.created, first.updated), (1, 0));

        let second = db.leads().sync(TENANT, &leads, false).await.unwrap();
        assert_eq!((second.created, second.updated), (0, 1));
        assert_eq!(db.leads().count_all(TENANT).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ids_are_counted_not_stored() {
        let db = setup().await;
        let mut missing = lead(1, 1);
        missing.id = None;
        let leads = vec![missing, lead(0, 1), lead(-4, 1), lead(5, 1)];

        let report = db.leads().sync(TENANT, &leads, false).await.unwrap();

        assert_eq!(report.processed, 4);
        assert_eq!(report.errors, 3);
        assert_eq!(report.created, 1);
        assert_eq!(db.leads().count_all(TENANT).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_update_is_skipped() {
        let db = setup().await;
        db.leads().sync(TENANT, &[lead(1, 2000)], false).await.unwrap();

        let mut older = lead(1, 1000);
        older.status_id = 99;
        let report = db.leads().sync(TENANT, &[older], false).await.unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(report.updated, 0);
        let stored = db.leads().get(TENANT, 1).await.unwrap().unwrap();
        assert_eq!(stored.lead.status_id, 10);
        assert_eq!(stored.lead.updated_at, 2000);
    }

    #[tokio::test]
    async fn test_duplicates_in_batch_fold_to_newest() {
        let db = setup().await;
        let mut newer = lead(1, 300);
        newer.status_id = 30;
        let leads = vec![lead(1, 100), newer, lead(1, 200)];

        let report = db.leads().sync(TENANT, &leads, false).await.unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.stale, 2);
        let stored = db.leads().get(TENANT, 1).await.unwrap().unwrap();
        assert_eq!(stored.lead.status_id, 30);
    }

    #[tokio::test]
    async fn test_full_sync_soft_deletes_missing() {
        let db = setup().await;
        let repo = db.leads();

        repo.sync(TENANT, &[lead(1, 1), lead(2, 1), lead(3, 1)], true)
            .await
            .unwrap();
        let report = repo
            .sync(TENANT, &[lead(1, 1), lead(2, 1)], true)
            .await
            .unwrap();
        assert_eq!(report.soft_deleted, 1);

        let page = repo.query(TENANT, &LeadQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.total_including_deleted, 3);

        let gone = repo.get(TENANT, 3).await.unwrap().unwrap();
        assert_eq!(gone.lead.is_deleted, Some(true));

        // Already deleted rows are not counted again.
        let again = repo
            .sync(TENANT, &[lead(1, 1), lead(2, 1)], true)
            .await
            .unwrap();
        assert_eq!(again.soft_deleted, 0);
    }

    #[tokio::test]
    async fn test_incremental_sync_never_soft_deletes() {
        let db = setup().await;
        let repo = db.leads();

        repo.sync(TENANT, &[lead(1, 1), lead(2, 1)], true)
            .await
            .unwrap();
        let report = repo.sync(TENANT, &[lead(1, 2)], false).await.unwrap();

        assert_eq!(report.soft_deleted, 0);
        let page = repo.query(TENANT, &LeadQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_reappearing_lead_is_restored() {
        let db = setup().await;
        let repo = db.leads();

        repo.sync(TENANT, &[lead(1, 1), lead(2, 1)], true)
            .await
            .unwrap();
        repo.sync(TENANT, &[lead(1, 1)], true).await.unwrap();
        repo.sync(TENANT, &[lead(1, 1), lead(2, 1)], true)
            .await
            .unwrap();

        let page = repo.query(TENANT, &LeadQuery::default()).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let db = setup().await;
        let repo = db.leads();

        repo.sync("a", &[lead(1, 1), lead(2, 1)], true).await.unwrap();
        let report = repo.sync("b", &[lead(1, 1)], true).await.unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.soft_deleted, 0);
        assert_eq!(repo.count_all("a").await.unwrap(), 2);
        assert_eq!(repo.count_all("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_lead_does_not_block_batch() {
        let db = setup().await;
        sqlx::query(
            "CREATE TRIGGER poison BEFORE INSERT ON leads WHEN NEW.lead_id = 13 \
             BEGIN SELECT RAISE(ABORT, 'poisoned'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let leads: Vec<Lead> = (11..=15).map(|id| lead(id, 1)).collect();
        let report = db.leads().sync(TENANT, &leads, false).await.unwrap();

        assert_eq!(report.created, 4);
        assert_eq!(report.errors, 1);
        assert!(db.leads().get(TENANT, 13).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_violation_falls_back_to_update() {
        let db = setup().await;
        db.leads().sync(TENANT, &[lead(7, 1)], false).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER clash BEFORE INSERT ON leads WHEN NEW.lead_id = 7 \
             BEGIN SELECT RAISE(ABORT, 'UNIQUE constraint failed: leads.tenant_id, leads.lead_id'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let mut moved = lead(7, 5);
        moved.status_id = 42;
        let report = db
            .leads()
            .sync(TENANT, &[moved, lead(8, 1)], false)
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.errors, 0);
        let stored = db.leads().get(TENANT, 7).await.unwrap().unwrap();
        assert_eq!(stored.lead.status_id, 42);
    }

    #[tokio::test]
    async fn test_small_batches() {
        let db = setup().await;
        let repo = db.leads().with_batch_size(2);
        let leads: Vec<Lead> = (1..=5).map(|id| lead(id, 1)).collect();

        let report = repo.sync(TENANT, &leads, false).await.unwrap();
        assert_eq!(report.created, 5);
    }

    #[tokio::test]
    async fn test_query_filters_and_order() {
        let db = setup().await;
        let repo = db.leads();

        let mut a = tagged(lead(1, 1), &["vip"]);
        a.responsible_user_id = Some(7);
        let mut b = tagged(lead(2, 1), &["cold", "web"]);
        b.pipeline_id = 2;
        b.status_id = 20;
        let mut c = lead(3, 1);
        c.closed_at = Some(5000);
        repo.sync(TENANT, &[a, b, c], false).await.unwrap();

        let all = repo.query(TENANT, &LeadQuery::default()).await.unwrap();
        let ids: Vec<i64> = all.leads.iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let by_owner = LeadQuery {
            responsible_user_id: Some(7),
            ..Default::default()
        };
        assert_eq!(repo.query(TENANT, &by_owner).await.unwrap().total, 1);

        let by_tags = LeadQuery {
            tags: vec!["web".into(), "vip".into()],
            ..Default::default()
        };
        assert_eq!(repo.query(TENANT, &by_tags).await.unwrap().total, 2);

        let by_position = LeadQuery {
            pipeline_id: Some(2),
            status_id: Some(20),
            ..Default::default()
        };
        assert_eq!(repo.query(TENANT, &by_position).await.unwrap().total, 1);

        let created_range = LeadQuery {
            from: Some(150),
            to: Some(250),
            ..Default::default()
        };
        let page = repo.query(TENANT, &created_range).await.unwrap();
        assert_eq!(page.leads[0].id(), 2);

        let closed = LeadQuery {
            date_field: DateField::Closed,
            from: Some(1),
            ..Default::default()
        };
        assert_eq!(repo.query(TENANT, &closed).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_query_pagination() {
        let db = setup().await;
        let repo = db.leads();
        let leads: Vec<Lead> = (1..=5).map(|id| lead(id, 1)).collect();
        repo.sync(TENANT, &leads, false).await.unwrap();

        let second = LeadQuery {
            page: 2,
            limit: 2,
            ..Default::default()
        };
        let page = repo.query(TENANT, &second).await.unwrap();

        assert_eq!(page.total, 5);
        let ids: Vec<i64> = page.leads.iter().map(|l| l.id()).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_stored_lead_round_trips_payload() {
        let db = setup().await;
        let mut l = tagged(lead(1, 1700000000), &["vip"]);
        l.custom_fields = serde_json::json!([{"field_id": 1, "values": [{"value": "x"}]}]);
        l.name = Some("Deal".into());
        db.leads().sync(TENANT, &[l.clone()], false).await.unwrap();

        let stored = db.leads().get(TENANT, 1).await.unwrap().unwrap();
        assert_eq!(stored.lead, l);
        assert_eq!(stored.tenant_id, TENANT);
        assert_eq!(stored.last_modified_at.timestamp(), 1700000000);
    }

    #[tokio::test]
    async fn test_funnel_counts() {
        let db = setup().await;
        let repo = db.leads();
        repo.sync(
            TENANT,
            &[lead(1, 1), lead(2, 1), lead(3, 1).deleted()],
            false,
        )
        .await
        .unwrap();

        let tallies = repo.funnel_counts(TENANT).await.unwrap();
        assert_eq!(
            tallies,
            vec![
                LeadTally {
                    pipeline_id: 1,
                    status_id: 10,
                    is_deleted: false,
                    count: 2
                },
                LeadTally {
                    pipeline_id: 1,
                    status_id: 10,
                    is_deleted: true,
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_soft_delete_ids() {
        let db = setup().await;
        let repo = db.leads();
        repo.sync(TENANT, &[lead(1, 1), lead(2, 1)], false)
            .await
            .unwrap();

        assert_eq!(repo.soft_delete_ids(TENANT, &[2, 99]).await.unwrap(), 1);
        assert_eq!(repo.soft_delete_ids(TENANT, &[2]).await.unwrap(), 0);
        assert_eq!(repo.soft_delete_ids(TENANT, &[]).await.unwrap(), 0);
        assert_eq!(
            repo.query(TENANT, &LeadQuery::default()).await.unwrap().total,
            1
        );
    }

    #[tokio::test]
    async fn test_apply_does_not_record_sync() {
        let db = setup().await;
        let repo = db.leads();

        let report = repo.apply(TENANT, &[lead(1, 1)]).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(repo.last_synced_at(TENANT).await.unwrap().is_none());

        repo.sync(TENANT, &[lead(2, 1)], false).await.unwrap();
        assert!(repo.last_synced_at(TENANT).await.unwrap().is_some());
    }
}
