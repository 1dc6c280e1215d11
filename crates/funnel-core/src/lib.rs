//! # funnel-core: Pure Domain Logic for Funnel
//!
//! Everything that can be decided without touching the network or the disk:
//! lead and pipeline types, lead validation, stage classification and the
//! funnel statistics math.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Funnel Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    funnel-api (axum)                            │   │
//! │  │      /stats   /leads   /sync   /webhook   /sync/status          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 funnel-sync (SyncOrchestrator)                  │   │
//! │  │        CrmClient ──► SyncEngine ──► SyncWorker ──► Stats        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ funnel-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌───────────┐ │   │
//! │  │   │   types   │  │ classifier │  │   stats   │  │ validation│ │   │
//! │  │   │   Lead    │  │  won/lost  │  │  totals   │  │   lead id │ │   │
//! │  │   │ Pipeline  │  │   /open    │  │  distrib. │  │   paging  │ │   │
//! │  │   └───────────┘  └────────────┘  └───────────┘  └───────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    funnel-db (Lead Store)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Lead, Pipeline, Stage, SyncReport, ...)
//! - [`classifier`] - Deterministic won/lost/open stage classification
//! - [`stats`] - Funnel totals and per-stage distribution
//! - [`validation`] - Lead and query validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use funnel_core::classifier::{Classifier, StageOutcome};
//! use funnel_core::types::{Pipeline, Stage, StageType};
//!
//! let pipeline = Pipeline::new(
//!     10,
//!     "Sales",
//!     vec![
//!         Stage::new(1, "New", 1),
//!         Stage::new(2, "Deal", 2),
//!         Stage::new(3, "Gone", 3),
//!     ],
//! );
//!
//! let classification = Classifier::default().classify(&pipeline);
//! assert_eq!(classification.outcome(1), Some(StageOutcome::Open));
//! assert_eq!(classification.outcome(2), Some(StageOutcome::Won));
//! assert_eq!(classification.outcome(3), Some(StageOutcome::Lost));
//! # let _ = StageType::Unspecified;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod classifier;
pub mod error;
pub mod stats;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use classifier::{Classification, Classifier, KeywordRule, KeywordRules, StageOutcome};
pub use error::{CoreError, CoreResult, ValidationError};
pub use stats::{compute_stats, tally_leads, FunnelStats, FunnelTotals, LeadTally};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Page size used by lead listings when the caller does not pick one.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Upper bound for a single lead listing page.
///
/// Matches the largest page the upstream CRM hands out, so a local page
/// never holds more than one remote page worth of leads.
pub const MAX_PAGE_LIMIT: u32 = 250;

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 64;
