//! # Sync Engine
//!
//! Runs one tenant's sync from CRM listing to stored leads, and keeps the
//! per-tenant clients and status.
//!
//! ## Sync Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         One Tenant Sync                                 │
//! │                                                                         │
//! │  Idle ──► Fetching ──────────────────────► Reconciling ──► Idle         │
//! │              │                                  │                       │
//! │              │  FULL                            │  complete FULL:       │
//! │              │    list everything               │    upsert + soft-     │
//! │              │  INCREMENTAL                     │    delete missing     │
//! │              │    list updated_since            │  otherwise:           │
//! │              │      last_synced_at - overlap    │    upsert only        │
//! │              │    (never synced → FULL)         │                       │
//! │              ▼                                  ▼                       │
//! │          CrmClient (cached per tenant)     LeadRepository              │
//! │                                                                         │
//! │  Errors leave the tenant Idle with `last_error` set.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Partial Listings
//! When a later listing page fails, the leads already collected are still
//! upserted, but without soft-delete reconciliation and without moving
//! `last_synced_at`, so the next incremental sync looks back far enough to
//! pick up what was missed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use funnel_core::validation::validate_tenant_id;
use funnel_core::{Classifier, Pipeline, SyncReport};
use funnel_db::Database;

use crate::client::{CrmClient, LeadFetch};
use crate::config::{SyncConfig, SyncMode};
use crate::credentials::CredentialResolver;
use crate::error::{SyncError, SyncResult};
use crate::protocol::RemoteLeadQuery;
use crate::stats::StatsService;
use crate::transport::HttpTransport;
use crate::webhook::{LeadWebhook, WebhookOutcome};

// =============================================================================
// Tenant Status
// =============================================================================

/// Where a tenant's sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    Reconciling,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Reconciling => write!(f, "reconciling"),
        }
    }
}

/// Sync status of one tenant, as reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantSyncStatus {
    pub phase: SyncPhase,

    /// Error (or partial-listing warning) of the most recent run.
    pub last_error: Option<String>,

    /// Report of the most recent run that reached the store.
    pub last_report: Option<SyncReport>,

    /// When the current or most recent run started.
    pub started_at: Option<DateTime<Utc>>,
}

impl TenantSyncStatus {
    pub fn is_running(&self) -> bool {
        self.phase != SyncPhase::Idle
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Executes syncs and webhook reconciliation for any tenant.
pub struct SyncEngine {
    db: Database,
    config: Arc<SyncConfig>,
    transport: Arc<dyn HttpTransport>,
    resolver: Arc<dyn CredentialResolver>,
    stats: StatsService,

    /// One client per tenant; holds that tenant's pacer and credentials.
    clients: RwLock<HashMap<String, Arc<CrmClient>>>,

    status: RwLock<HashMap<String, TenantSyncStatus>>,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        config: SyncConfig,
        transport: Arc<dyn HttpTransport>,
        resolver: Arc<dyn CredentialResolver>,
    ) -> Self {
        let classifier = Classifier::new(config.classifier.keyword_rules());

        SyncEngine {
            stats: StatsService::new(db.clone(), classifier),
            db,
            config: Arc::new(config),
            transport,
            resolver,
            clients: RwLock::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats_service(&self) -> &StatsService {
        &self.stats
    }

    // =========================================================================
    // Clients & Credentials
    // =========================================================================

    /// Returns the tenant's client, creating it on first use.
    pub async fn client(&self, tenant_id: &str) -> SyncResult<Arc<CrmClient>> {
        validate_tenant_id(tenant_id)?;

        if let Some(client) = self.clients.read().await.get(tenant_id) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        let client = clients
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                debug!(tenant_id = %tenant_id, "Creating CRM client");
                Arc::new(CrmClient::new(
                    tenant_id,
                    self.transport.clone(),
                    self.resolver.clone(),
                    self.config.client.clone(),
                ))
            })
            .clone();

        Ok(client)
    }

    /// True when the resolver has credentials for the tenant.
    pub async fn has_credentials(&self, tenant_id: &str) -> SyncResult<bool> {
        validate_tenant_id(tenant_id)?;
        Ok(self.resolver.resolve(tenant_id).await?.is_some())
    }

    /// Fails with `AuthMissing` unless the tenant is configured.
    pub async fn require_credentials(&self, tenant_id: &str) -> SyncResult<()> {
        if self.has_credentials(tenant_id).await? {
            Ok(())
        } else {
            Err(SyncError::AuthMissing {
                tenant_id: tenant_id.to_string(),
            })
        }
    }

    /// Live pipelines of the tenant.
    pub async fn pipelines(&self, tenant_id: &str) -> SyncResult<Vec<Pipeline>> {
        self.client(tenant_id).await?.fetch_pipelines().await
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn status(&self, tenant_id: &str) -> TenantSyncStatus {
        self.status
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn set_phase(&self, tenant_id: &str, phase: SyncPhase) {
        let mut status = self.status.write().await;
        let entry = status.entry(tenant_id.to_string()).or_default();
        if entry.phase == SyncPhase::Idle && phase != SyncPhase::Idle {
            entry.started_at = Some(Utc::now());
        }
        entry.phase = phase;
    }

    async fn finish(
        &self,
        tenant_id: &str,
        result: &SyncResult<SyncReport>,
        warning: Option<String>,
    ) {
        let mut status = self.status.write().await;
        let entry = status.entry(tenant_id.to_string()).or_default();
        entry.phase = SyncPhase::Idle;
        match result {
            Ok(report) => {
                entry.last_report = Some(report.clone());
                entry.last_error = warning;
            }
            Err(e) => entry.last_error = Some(e.to_string()),
        }
    }

    /// Records a failure that happened outside a sync run.
    pub async fn record_error(&self, tenant_id: &str, error: &SyncError) {
        let mut status = self.status.write().await;
        let entry = status.entry(tenant_id.to_string()).or_default();
        entry.phase = SyncPhase::Idle;
        entry.last_error = Some(error.to_string());
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Fetches and stores the tenant's leads.
    pub async fn run_sync(&self, tenant_id: &str, mode: SyncMode) -> SyncResult<SyncReport> {
        validate_tenant_id(tenant_id)?;
        self.set_phase(tenant_id, SyncPhase::Fetching).await;

        let (result, warning) = match self.sync_inner(tenant_id, mode).await {
            Ok((report, warning)) => (Ok(report), warning),
            Err(e) => (Err(e), None),
        };

        if let Err(ref e) = result {
            warn!(tenant_id = %tenant_id, mode = %mode, error = %e, "Sync failed");
        }

        self.finish(tenant_id, &result, warning).await;
        result
    }

    async fn sync_inner(
        &self,
        tenant_id: &str,
        mode: SyncMode,
    ) -> SyncResult<(SyncReport, Option<String>)> {
        let client = self.client(tenant_id).await?;
        let (query, full) = self.plan(tenant_id, mode).await?;

        info!(
            tenant_id = %tenant_id,
            requested = %mode,
            full,
            updated_since = ?query.updated_since,
            "Starting sync"
        );

        let fetch = if self.config.sync.enrich_details {
            client.fetch_all_with_full_details(&query).await?
        } else {
            client.fetch_all(&query).await?
        };

        self.set_phase(tenant_id, SyncPhase::Reconciling).await;
        self.store_fetch(tenant_id, fetch, full).await
    }

    /// Stores a fetched set; only a complete full listing reconciles deletions.
    async fn store_fetch(
        &self,
        tenant_id: &str,
        fetch: LeadFetch,
        full: bool,
    ) -> SyncResult<(SyncReport, Option<String>)> {
        if fetch.complete {
            let report = self.db.leads().sync(tenant_id, &fetch.leads, full).await?;
            return Ok((report, None));
        }

        let warning = format!(
            "lead listing stopped after {} page(s); stored {} leads without reconciliation",
            fetch.pages,
            fetch.leads.len()
        );
        warn!(tenant_id = %tenant_id, pages = fetch.pages, "Partial lead listing");

        let report = self.db.leads().apply(tenant_id, &fetch.leads).await?;
        Ok((report, Some(warning)))
    }

    /// Picks the listing filter and whether the run is a full sync.
    async fn plan(&self, tenant_id: &str, mode: SyncMode) -> SyncResult<(RemoteLeadQuery, bool)> {
        if mode.is_full() {
            return Ok((RemoteLeadQuery::all(), true));
        }

        match self.db.sync_state().last_synced_at(tenant_id).await? {
            Some(last) => {
                let since = last.timestamp() - self.config.overlap_secs();
                Ok((RemoteLeadQuery::updated_since(since.max(0)), false))
            }
            None => {
                info!(tenant_id = %tenant_id, "Tenant never synced; escalating to full sync");
                Ok((RemoteLeadQuery::all(), true))
            }
        }
    }

    /// Fetches every lead and the pipelines for a live stats answer.
    pub async fn fetch_live(&self, tenant_id: &str) -> SyncResult<(LeadFetch, Vec<Pipeline>)> {
        validate_tenant_id(tenant_id)?;
        self.set_phase(tenant_id, SyncPhase::Fetching).await;

        let result = async {
            let client = self.client(tenant_id).await?;
            let fetch = client.fetch_all(&RemoteLeadQuery::all()).await?;
            let pipelines = client.fetch_pipelines().await?;
            Ok::<_, SyncError>((fetch, pipelines))
        }
        .await;

        match result {
            Ok(value) => {
                self.set_phase(tenant_id, SyncPhase::Idle).await;
                Ok(value)
            }
            Err(e) => {
                self.record_error(tenant_id, &e).await;
                Err(e)
            }
        }
    }

    /// Stores an already fetched set as one sync run.
    pub async fn reconcile(&self, tenant_id: &str, fetch: LeadFetch) -> SyncResult<SyncReport> {
        validate_tenant_id(tenant_id)?;
        self.set_phase(tenant_id, SyncPhase::Reconciling).await;

        let (result, warning) = match self.store_fetch(tenant_id, fetch, true).await {
            Ok((report, warning)) => (Ok(report), warning),
            Err(e) => (Err(e), None),
        };

        self.finish(tenant_id, &result, warning).await;
        result
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Re-pulls the leads a webhook names and soft-deletes the removed ones.
    ///
    /// Does not touch `last_synced_at`.
    pub async fn apply_webhook(
        &self,
        tenant_id: &str,
        webhook: &LeadWebhook,
    ) -> SyncResult<WebhookOutcome> {
        validate_tenant_id(tenant_id)?;

        let mut outcome = WebhookOutcome::default();
        let mut gone = webhook.delete_ids();
        let upsert_ids = webhook.upsert_ids();

        if !upsert_ids.is_empty() {
            let client = self.client(tenant_id).await?;
            let mut fetched = Vec::with_capacity(upsert_ids.len());

            for id in upsert_ids {
                match client.fetch_by_id(id).await {
                    Ok(Some(lead)) => fetched.push(lead),
                    Ok(None) => gone.push(id),
                    Err(e @ SyncError::AuthMissing { .. }) => return Err(e),
                    Err(e) => {
                        warn!(
                            tenant_id = %tenant_id,
                            lead_id = id,
                            error = %e,
                            "Webhook re-fetch failed"
                        );
                        outcome.errors += 1;
                    }
                }
            }

            let report = self.db.leads().apply(tenant_id, &fetched).await?;
            outcome.upserted = report.written();
            outcome.errors += report.errors;
        }

        gone.sort_unstable();
        gone.dedup();
        outcome.soft_deleted = self.db.leads().soft_delete_ids(tenant_id, &gone).await?;

        info!(
            tenant_id = %tenant_id,
            upserted = outcome.upserted,
            soft_deleted = outcome.soft_deleted,
            errors = outcome.errors,
            "Webhook applied"
        );

        Ok(outcome)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credentials::{CrmCredentials, StaticCredentialResolver};
    use crate::fake::{FakeCrm, Failure};
    use funnel_core::Lead;
    use funnel_db::DbConfig;

    /// Config with no pacing and millisecond backoff.
    pub(crate) fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.client.min_interval_ms = 0;
        config.client.base_backoff_ms = 1;
        config.client.max_backoff_ms = 10;
        config.client.enrich_delay_ms = 0;
        config
    }

    pub(crate) async fn engine_with(fake: Arc<FakeCrm>, config: SyncConfig) -> SyncEngine {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let resolver = StaticCredentialResolver::new()
            .with_tenant("acme", CrmCredentials::new(FakeCrm::BASE_URL, "tok"));
        SyncEngine::new(db, config, fake, Arc::new(resolver))
    }

    fn leads(n: i64) -> Vec<Lead> {
        (1..=n)
            .map(|i| Lead::new(i, 100, 101).with_updated_at(1_000 + i))
            .collect()
    }

    #[tokio::test]
    async fn test_full_sync_stores_and_reconciles() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(3)));
        let engine = engine_with(fake.clone(), fast_config()).await;

        let first = engine.run_sync("acme", SyncMode::Full).await.unwrap();
        assert_eq!(first.created, 3);
        assert!(first.full_sync);

        fake.remove_lead(2);
        let second = engine.run_sync("acme", SyncMode::Full).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.soft_deleted, 1);

        let stored = engine.db().leads().get("acme", 2).await.unwrap().unwrap();
        assert_eq!(stored.lead.is_deleted, Some(true));

        let status = engine.status("acme").await;
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.last_report, Some(second));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_incremental_without_history_escalates_to_full() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(2)));
        let engine = engine_with(fake.clone(), fast_config()).await;

        let report = engine.run_sync("acme", SyncMode::Incremental).await.unwrap();
        assert!(report.full_sync);
        assert!(fake.requests()[0]
            .query_value("filter[updated_at][from]")
            .is_none());
    }

    #[tokio::test]
    async fn test_incremental_uses_overlap() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(2)));
        let engine = engine_with(fake.clone(), fast_config()).await;

        engine.run_sync("acme", SyncMode::Full).await.unwrap();
        let last = engine
            .db()
            .sync_state()
            .last_synced_at("acme")
            .await
            .unwrap()
            .unwrap();

        let report = engine.run_sync("acme", SyncMode::Incremental).await.unwrap();
        assert!(!report.full_sync);
        assert_eq!(report.soft_deleted, 0);

        let requests = fake.requests();
        let since: i64 = requests
            .last()
            .and_then(|r| r.query_value("filter[updated_at][from]"))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(since, last.timestamp() - 300);
    }

    #[tokio::test]
    async fn test_partial_full_listing_skips_soft_delete() {
        let mut config = fast_config();
        config.client.page_size = 2;
        let fake = Arc::new(FakeCrm::new().with_leads(leads(5)));
        let engine = engine_with(fake.clone(), config).await;

        engine.run_sync("acme", SyncMode::Full).await.unwrap();

        fake.fail_page(2, Failure::Status(503));
        let report = engine.run_sync("acme", SyncMode::Full).await.unwrap();

        assert!(!report.full_sync);
        assert_eq!(report.soft_deleted, 0);
        assert_eq!(engine.db().leads().count_all("acme").await.unwrap(), 5);

        let status = engine.status("acme").await;
        assert!(status.last_error.unwrap().contains("stopped after 1 page"));
    }

    #[tokio::test]
    async fn test_missing_credentials_recorded_in_status() {
        let fake = Arc::new(FakeCrm::new());
        let engine = engine_with(fake, fast_config()).await;

        let err = engine.run_sync("globex", SyncMode::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthMissing { .. }));

        let status = engine.status("globex").await;
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(status.last_error.is_some());
        assert!(status.started_at.is_some());
        assert!(!engine.has_credentials("globex").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_tenant_rejected() {
        let engine = engine_with(Arc::new(FakeCrm::new()), fast_config()).await;
        let err = engine.run_sync("", SyncMode::Full).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_tenant() {
        let engine = engine_with(Arc::new(FakeCrm::new()), fast_config()).await;
        let a = engine.client("acme").await.unwrap();
        let b = engine.client("acme").await.unwrap();
        let c = engine.client("globex").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.tenant_id(), "globex");
    }

    #[tokio::test]
    async fn test_webhook_refetches_and_deletes() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(3)));
        let engine = engine_with(fake.clone(), fast_config()).await;
        engine.run_sync("acme", SyncMode::Full).await.unwrap();
        let synced_at = engine.db().leads().last_synced_at("acme").await.unwrap();

        fake.upsert_lead(Lead::new(1, 100, 102).with_updated_at(5_000));
        fake.upsert_lead(Lead::new(4, 100, 101).with_updated_at(5_000));
        fake.remove_lead(2);

        let webhook = LeadWebhook {
            add: vec![4],
            status: vec![1],
            update: vec![2],
            delete: vec![3],
        };
        let outcome = engine.apply_webhook("acme", &webhook).await.unwrap();

        assert_eq!(outcome.upserted, 2);
        assert_eq!(outcome.soft_deleted, 2);
        assert_eq!(outcome.errors, 0);

        let moved = engine.db().leads().get("acme", 1).await.unwrap().unwrap();
        assert_eq!(moved.lead.status_id, 102);
        assert!(engine.db().leads().get("acme", 4).await.unwrap().is_some());

        // Webhooks never move the sync watermark.
        assert_eq!(engine.db().leads().last_synced_at("acme").await.unwrap(), synced_at);
    }

    #[tokio::test]
    async fn test_fetch_live_and_reconcile() {
        let fake = Arc::new(FakeCrm::demo());
        let engine = engine_with(fake, fast_config()).await;

        let (fetch, pipelines) = engine.fetch_live("acme").await.unwrap();
        assert!(fetch.complete);
        assert_eq!(pipelines.len(), 2);
        assert!(engine.db().leads().last_synced_at("acme").await.unwrap().is_none());

        let report = engine.reconcile("acme", fetch).await.unwrap();
        assert_eq!(report.created, 24);
        assert!(engine.db().leads().last_synced_at("acme").await.unwrap().is_some());
    }
}
