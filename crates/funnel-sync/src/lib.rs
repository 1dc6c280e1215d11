//! # funnel-sync: CRM Sync Engine for Funnel
//!
//! This crate keeps each tenant's lead store in step with its Kommo account
//! and answers funnel questions from whichever side is appropriate.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Architecture                               │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                SyncOrchestrator (entry point)                    │  │
//! │  │                                                                  │  │
//! │  │  sync_now • trigger_sync • stats • list_leads • handle_webhook   │  │
//! │  └──────────────┬──────────────────────────────────┬────────────────┘  │
//! │                 │                                  │                   │
//! │                 ▼                                  ▼                   │
//! │  ┌────────────────────────────┐     ┌────────────────────────────┐    │
//! │  │        SyncEngine          │◄────│        SyncWorker          │    │
//! │  │                            │     │                            │    │
//! │  │ Full / incremental plans   │     │ mpsc job queue             │    │
//! │  │ Reconcile into funnel-db   │     │ one task per job           │    │
//! │  │ Per-tenant status          │     │ drains on shutdown         │    │
//! │  └─────────────┬──────────────┘     └────────────────────────────┘    │
//! │                │                                                       │
//! │                ▼                                                       │
//! │  ┌────────────────────────────┐     ┌────────────────────────────┐    │
//! │  │   CrmClient (per tenant)   │────►│   HttpTransport            │    │
//! │  │                            │     │                            │    │
//! │  │ Credential cache           │     │ ReqwestTransport (prod)    │    │
//! │  │ Request pacing             │     │ FakeCrm (tests, demo)      │    │
//! │  │ 429 / 5xx backoff          │     │                            │    │
//! │  └────────────────────────────┘     └────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`orchestrator`] - `SyncOrchestrator` and its builder
//! - [`engine`] - Sync runs, reconciliation, webhook application
//! - [`worker`] - Background job executor
//! - [`client`] - Rate-limited Kommo API client
//! - [`protocol`] - Kommo v4 wire types and decoders
//! - [`transport`] - HTTP transport seam
//! - [`credentials`] - Tenant credential lookup and caching
//! - [`stats`] - Funnel stats from the store or a fetched set
//! - [`webhook`] - Lead webhook parsing
//! - [`fake`] - In-memory CRM
//! - [`config`] - Sync configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use funnel_sync::{StaticCredentialResolver, SyncConfig, SyncMode, SyncOrchestrator};
//! use funnel_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("funnel.db")).await?;
//! let orchestrator = SyncOrchestrator::builder(SyncConfig::load_or_default(None))
//!     .with_database(db)
//!     .with_resolver(Arc::new(StaticCredentialResolver::new()))
//!     .build()?;
//!
//! let ticket = orchestrator.trigger_sync("acme", SyncMode::Incremental).await?;
//! let stats = orchestrator.stats("acme", false).await?;
//! println!("needs sync: {}", stats.needs_sync);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod fake;
pub mod orchestrator;
pub mod protocol;
pub mod stats;
pub mod transport;
pub mod webhook;
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{CrmClient, LeadFetch, LeadPage};
pub use config::{
    ClassifierSettings, ClientSettings, StoreSettings, SyncConfig, SyncMode, SyncSettings,
};
pub use credentials::{
    CredentialCache, CredentialResolver, CrmCredentials, StaticCredentialResolver,
};
pub use engine::{SyncEngine, SyncPhase, TenantSyncStatus};
pub use error::{SyncError, SyncResult};
pub use fake::{FakeCrm, Failure};
pub use orchestrator::{LeadListing, SyncOrchestrator, SyncOrchestratorBuilder};
pub use protocol::RemoteLeadQuery;
pub use stats::{StatsService, StatsSource, TenantStats};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use webhook::{LeadWebhook, WebhookOutcome};
pub use worker::{SyncJob, SyncTicket, SyncWorker, SyncWorkerHandle};
