//! # Funnel API
//!
//! HTTP surface for lead sync and funnel analytics.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Funnel API Routes                             │
//! │                                                                         │
//! │  GET  /health                                                           │
//! │                                                                         │
//! │  /api/tenants/{tenant_id}                                               │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────────┐│
//! │  │  Reads         │  │  Sync          │  │  Webhooks                  ││
//! │  │                │  │                │  │                            ││
//! │  │ GET /stats     │  │ POST /sync     │  │ POST /webhook              ││
//! │  │   ?refresh=    │  │   → 202 ticket │  │   Kommo form encoding      ││
//! │  │ GET /leads     │  │ GET /sync/     │  │   add/update/status/delete ││
//! │  │   filters+page │  │       status   │  │                            ││
//! │  └────────────────┘  └────────────────┘  └────────────────────────────┘│
//! │                                                                         │
//! │              all routes ──► SyncOrchestrator (funnel-sync)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! `funnel-api.toml` (optional) and `FUNNEL_API__*` environment variables:
//! - `bind_addr` - listen address (default: 127.0.0.1:8080)
//! - `database_path` - SQLite file (default: funnel.db)
//! - `sync_config_path` - sync engine TOML
//! - `demo` - serve tenants from the built-in demo CRM
//! - `tenants.<id>.base_url` / `tenants.<id>.access_token`

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use funnel_sync::SyncOrchestrator;

// Re-exports
pub use config::AppConfig;
pub use error::{ApiError, ApiResult};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        AppState { orchestrator }
    }
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/stats", get(routes::stats))
        .route("/leads", get(routes::list_leads))
        .route("/sync", post(routes::trigger_sync))
        .route("/sync/status", get(routes::sync_status))
        .route("/webhook", post(routes::webhook));

    Router::new()
        .route("/health", get(routes::health))
        .nest("/api/tenants/{tenant_id}", tenant_routes)
        .with_state(state)
}
