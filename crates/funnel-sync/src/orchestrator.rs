//! # Sync Orchestrator
//!
//! Entry point for everything the HTTP layer asks of the sync engine.
//!
//! ## Access Patterns
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SyncOrchestrator Operations                         │
//! │                                                                         │
//! │  FOREGROUND (caller waits)                                              │
//! │  ─────────────────────────                                              │
//! │  sync_now(tenant, mode)     ──► SyncEngine::run_sync                    │
//! │  stats(tenant, false)       ──► store tallies (needs_sync until synced) │
//! │  stats(tenant, true)        ──► live fetch ──► stats ─┐                 │
//! │  list_leads(tenant, query)  ──► store page            │                 │
//! │  handle_webhook(tenant, ..) ──► re-fetch by id        │                 │
//! │                                                       │                 │
//! │  BACKGROUND (caller gets a ticket or nothing)         │                 │
//! │  ────────────────────────────────────────────         ▼                 │
//! │  trigger_sync(tenant, mode) ──► SyncWorker ◄── Reconcile(fetched set)   │
//! │                                                                         │
//! │  Reads never contact the CRM unless asked to refresh.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use funnel_core::validation::{validate_lead_query, validate_tenant_id};
use funnel_core::{FunnelStats, LeadQuery, LeadQueryPage, SyncReport};
use funnel_db::Database;

use crate::config::{SyncConfig, SyncMode};
use crate::credentials::CredentialResolver;
use crate::engine::{SyncEngine, TenantSyncStatus};
use crate::error::{SyncError, SyncResult};
use crate::stats::{StatsSource, TenantStats};
use crate::transport::HttpTransport;
use crate::webhook::{LeadWebhook, WebhookOutcome};
use crate::worker::{SyncJob, SyncTicket, SyncWorker, SyncWorkerHandle};

/// A page of stored leads for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadListing {
    #[serde(flatten)]
    pub page: LeadQueryPage,

    /// True when nothing has been stored for the tenant yet.
    pub needs_sync: bool,

    pub last_synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Sync Orchestrator
// =============================================================================

/// Coordinates foreground reads and background syncs across tenants.
pub struct SyncOrchestrator {
    engine: Arc<SyncEngine>,
    worker: SyncWorkerHandle,
}

impl SyncOrchestrator {
    /// Wraps an engine and starts its background worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let queue_size = engine.config().sync.queue_size;
        let worker = SyncWorker::spawn(engine.clone(), queue_size);

        info!(queue_size, "Sync orchestrator started");

        SyncOrchestrator { engine, worker }
    }

    pub fn builder(config: SyncConfig) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder::new(config)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn db(&self) -> &Database {
        self.engine.db()
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Runs a sync and waits for its report.
    pub async fn sync_now(&self, tenant_id: &str, mode: SyncMode) -> SyncResult<SyncReport> {
        self.engine.run_sync(tenant_id, mode).await
    }

    /// Queues a sync and returns as soon as the worker accepted it.
    pub async fn trigger_sync(&self, tenant_id: &str, mode: SyncMode) -> SyncResult<SyncTicket> {
        self.engine.require_credentials(tenant_id).await?;

        let ticket = SyncTicket::new(tenant_id, mode);
        self.worker.submit(SyncJob::Sync(ticket.clone())).await?;

        info!(tenant_id = %tenant_id, job_id = %ticket.job_id, mode = %mode, "Sync queued");
        Ok(ticket)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Funnel stats for a tenant.
    ///
    /// Without `refresh` the answer comes from the store and the CRM is only
    /// asked for pipelines, and only when there are stored leads to place.
    /// With `refresh` every lead is fetched now; the fetched set is then
    /// handed to the worker so the store catches up in the background.
    pub async fn stats(&self, tenant_id: &str, refresh: bool) -> SyncResult<TenantStats> {
        validate_tenant_id(tenant_id)?;
        let last_synced_at = self.last_synced_at(tenant_id).await?;

        if refresh {
            return self.live_stats(tenant_id, last_synced_at).await;
        }

        let needs_sync = last_synced_at.is_none();
        let stored = self.db().leads().count_all(tenant_id).await?;
        if stored == 0 {
            return Ok(TenantStats {
                stats: FunnelStats::default(),
                needs_sync,
                source: StatsSource::Store,
                last_synced_at,
            });
        }

        let pipelines = self.engine.pipelines(tenant_id).await?;
        let stats = self
            .engine
            .stats_service()
            .from_store(tenant_id, &pipelines)
            .await?;

        Ok(TenantStats {
            stats,
            needs_sync,
            source: StatsSource::Store,
            last_synced_at,
        })
    }

    async fn live_stats(
        &self,
        tenant_id: &str,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> SyncResult<TenantStats> {
        let (fetch, pipelines) = self.engine.fetch_live(tenant_id).await?;
        let stats = self
            .engine
            .stats_service()
            .from_leads(tenant_id, &fetch.leads, &pipelines);

        let job = SyncJob::Reconcile {
            tenant_id: tenant_id.to_string(),
            fetch,
        };
        if let Err(e) = self.worker.submit(job).await {
            warn!(
                tenant_id = %tenant_id,
                error = %e,
                "Could not queue reconciliation of refreshed leads"
            );
        }

        Ok(TenantStats {
            stats,
            needs_sync: false,
            source: StatsSource::Live,
            last_synced_at,
        })
    }

    /// A filtered page of stored leads.
    pub async fn list_leads(&self, tenant_id: &str, query: &LeadQuery) -> SyncResult<LeadListing> {
        validate_tenant_id(tenant_id)?;
        validate_lead_query(query)?;

        let page = self.db().leads().query(tenant_id, query).await?;
        let last_synced_at = self.last_synced_at(tenant_id).await?;

        Ok(LeadListing {
            needs_sync: last_synced_at.is_none(),
            page,
            last_synced_at,
        })
    }

    /// When the tenant's last complete sync finished.
    pub async fn last_synced_at(&self, tenant_id: &str) -> SyncResult<Option<DateTime<Utc>>> {
        validate_tenant_id(tenant_id)?;
        Ok(self.db().sync_state().last_synced_at(tenant_id).await?)
    }

    pub async fn status(&self, tenant_id: &str) -> SyncResult<TenantSyncStatus> {
        validate_tenant_id(tenant_id)?;
        Ok(self.engine.status(tenant_id).await)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    /// Applies a lead webhook in the foreground.
    pub async fn handle_webhook(
        &self,
        tenant_id: &str,
        webhook: &LeadWebhook,
    ) -> SyncResult<WebhookOutcome> {
        if webhook.is_empty() {
            validate_tenant_id(tenant_id)?;
            return Ok(WebhookOutcome::default());
        }
        self.engine.apply_webhook(tenant_id, webhook).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops the worker after the jobs it already started.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down sync orchestrator");
        self.worker.shutdown().await
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncOrchestrator with its collaborators.
pub struct SyncOrchestratorBuilder {
    config: SyncConfig,
    db: Option<Database>,
    transport: Option<Arc<dyn HttpTransport>>,
    resolver: Option<Arc<dyn CredentialResolver>>,
}

impl SyncOrchestratorBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncOrchestratorBuilder {
            config,
            db: None,
            transport: None,
            resolver: None,
        }
    }

    /// Sets the lead store.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the HTTP transport. Defaults to reqwest.
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets where tenant credentials come from.
    pub fn with_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validates the config and starts the orchestrator.
    pub fn build(self) -> SyncResult<SyncOrchestrator> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let resolver = self
            .resolver
            .ok_or_else(|| SyncError::InvalidConfig("Credential resolver required".into()))?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(crate::transport::ReqwestTransport::new(
                self.config.client.transport_config(),
            )?),
        };

        let engine = SyncEngine::new(db, self.config, transport, resolver);
        Ok(SyncOrchestrator::new(Arc::new(engine)))
    }
}
