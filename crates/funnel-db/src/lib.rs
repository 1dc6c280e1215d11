//! # funnel-db: Lead Store for Funnel
//!
//! This crate provides tenant-scoped storage for CRM leads.
//! It uses SQLite with sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Funnel Data Flow                                 │
//! │                                                                         │
//! │  SyncEngine (funnel-sync)          HTTP handlers (funnel-api)          │
//! │       │ sync / apply / soft delete       │ query / funnel_counts       │
//! │       ▼                                  ▼                              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     funnel-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ LeadRepository │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncStateRepo  │   │ 001_leads    │  │   │
//! │  │   │ TenantLocks   │    │                │   │ ...          │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   leads (tenant_id, lead_id) + tenant_sync_state                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`locks`] - Per-tenant reconciliation locks
//! - [`repository`] - Lead and sync-state repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use funnel_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("funnel.db")).await?;
//!
//! let report = db.leads().sync("acme", &leads, true).await?;
//! let page = db.leads().query("acme", &LeadQuery::default()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod locks;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use locks::TenantLocks;
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::lead::{LeadRepository, WriteOutcome};
pub use repository::sync_state::SyncStateRepository;

// =============================================================================
// Constants
// =============================================================================

/// Leads written per transaction unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 50;
