//! # Funnel API
//!
//! HTTP server for lead sync and funnel analytics.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Funnel API Server                              │
//! │                                                                         │
//! │  AppConfig ──► SyncConfig ──► Database ──► SyncOrchestrator ──► axum    │
//! │                                                  │                      │
//! │                                                  ▼                      │
//! │                                   Kommo (reqwest) or demo CRM           │
//! │                                                                         │
//! │  Ctrl+C / SIGTERM: stop accepting requests, drain the sync worker,     │
//! │  close the pool.                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use funnel_api::{router, AppConfig, AppState};
use funnel_db::{Database, DbConfig};
use funnel_sync::{FakeCrm, HttpTransport, SyncConfig, SyncOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Funnel API server...");

    // First argument overrides the config file location.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading API configuration")?;

    let sync_config = SyncConfig::load(config.sync_config_path.clone())
        .context("loading sync configuration")?;

    info!(
        bind_addr = %config.bind_addr,
        database = ?config.database_path,
        tenants = config.tenants.len(),
        demo = config.demo,
        "Configuration loaded"
    );

    let db_config = DbConfig::new(&config.database_path).batch_size(sync_config.store.batch_size);
    let db = Database::new(db_config)
        .await
        .context("opening lead store")?;

    let resolver = Arc::new(config.resolver(FakeCrm::BASE_URL));
    let mut builder = SyncOrchestrator::builder(sync_config)
        .with_database(db.clone())
        .with_resolver(resolver);

    if config.demo {
        info!("Demo mode: tenants are served by the in-memory CRM");
        let transport: Arc<dyn HttpTransport> = Arc::new(FakeCrm::demo());
        builder = builder.with_transport(transport);
    }

    let orchestrator = Arc::new(builder.build().context("starting sync orchestrator")?);
    let app = router(AppState::new(orchestrator.clone()));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    orchestrator.shutdown().await?;
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
