//! Request handlers.
//!
//! Handlers only translate HTTP into `SyncOrchestrator` calls; every rule
//! about when to reach the CRM lives in funnel-sync.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use funnel_core::{DateField, LeadQuery, DEFAULT_PAGE_LIMIT};
use funnel_sync::{
    LeadListing, LeadWebhook, SyncMode, SyncTicket, TenantStats, TenantSyncStatus, WebhookOutcome,
};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub pending_migrations: usize,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db = state.orchestrator.db();
    let database = db.health_check().await;
    let pending_migrations = match db.migration_status().await {
        Ok((embedded, applied)) => embedded.saturating_sub(applied),
        Err(_) => 0,
    };

    let (code, status) = if database && pending_migrations == 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            database,
            pending_migrations,
        }),
    )
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    #[serde(default)]
    pub refresh: bool,
}

pub async fn stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<TenantStats>> {
    let stats = state
        .orchestrator
        .stats(&tenant_id, params.refresh)
        .await?;
    Ok(Json(stats))
}

// =============================================================================
// Leads
// =============================================================================

/// Query string of `GET /leads`; `tags` is comma separated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LeadParams {
    pub date_field: Option<DateField>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub responsible_user_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub status_id: Option<i64>,
    pub tags: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl From<LeadParams> for LeadQuery {
    fn from(params: LeadParams) -> Self {
        let tags = params
            .tags
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        LeadQuery {
            date_field: params.date_field.unwrap_or_default(),
            from: params.from,
            to: params.to,
            responsible_user_id: params.responsible_user_id,
            pipeline_id: params.pipeline_id,
            status_id: params.status_id,
            tags,
            page: params.page.unwrap_or(1),
            limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }
}

pub async fn list_leads(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<LeadParams>,
) -> ApiResult<Json<LeadListing>> {
    let query = LeadQuery::from(params);
    let listing = state.orchestrator.list_leads(&tenant_id, &query).await?;
    Ok(Json(listing))
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub mode: Option<SyncMode>,
}

/// Queues a sync. An empty body uses the configured default mode.
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SyncTicket>)> {
    let request: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let mode = request
        .mode
        .unwrap_or_else(|| state.orchestrator.engine().config().default_mode());

    let ticket = state.orchestrator.trigger_sync(&tenant_id, mode).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    #[serde(flatten)]
    pub status: TenantSyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub async fn sync_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<SyncStatusResponse>> {
    let status = state.orchestrator.status(&tenant_id).await?;
    let last_synced_at = state.orchestrator.last_synced_at(&tenant_id).await?;
    Ok(Json(SyncStatusResponse {
        status,
        last_synced_at,
    }))
}

// =============================================================================
// Webhooks
// =============================================================================

pub async fn webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: String,
) -> ApiResult<Json<WebhookOutcome>> {
    let webhook = LeadWebhook::from_form(&body)?;
    debug!(
        tenant_id = %tenant_id,
        upserts = webhook.upsert_ids().len(),
        deletes = webhook.delete_ids().len(),
        "Webhook received"
    );

    let outcome = state
        .orchestrator
        .handle_webhook(&tenant_id, &webhook)
        .await?;

    info!(
        tenant_id = %tenant_id,
        upserted = outcome.upserted,
        soft_deleted = outcome.soft_deleted,
        "Webhook handled"
    );
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use funnel_db::{Database, DbConfig};
    use funnel_sync::{
        CrmCredentials, FakeCrm, StaticCredentialResolver, SyncConfig, SyncOrchestrator,
    };

    async fn app() -> (Router, Arc<SyncOrchestrator>) {
        let mut config = SyncConfig::default();
        config.client.min_interval_ms = 0;
        config.client.base_backoff_ms = 1;
        config.client.max_backoff_ms = 10;
        config.client.enrich_delay_ms = 0;

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let resolver = StaticCredentialResolver::new()
            .with_tenant("acme", CrmCredentials::new(FakeCrm::BASE_URL, "tok"));

        let orchestrator = Arc::new(
            SyncOrchestrator::builder(config)
                .with_database(db)
                .with_transport(Arc::new(FakeCrm::demo()))
                .with_resolver(Arc::new(resolver))
                .build()
                .unwrap(),
        );

        (crate::router(AppState::new(orchestrator.clone())), orchestrator)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, content_type: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app().await;
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], true);
        assert_eq!(body["pending_migrations"], 0);
    }

    #[tokio::test]
    async fn test_stats_before_sync() {
        let (app, _) = app().await;
        let (status, body) = send(&app, get("/api/tenants/acme/stats")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["needs_sync"], true);
        assert_eq!(body["totals"]["total"], 0);
    }

    #[tokio::test]
    async fn test_sync_then_read() {
        let (app, orchestrator) = app().await;

        let (status, ticket) = send(
            &app,
            post("/api/tenants/acme/sync", "application/json", r#"{"mode":"full"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(ticket["mode"], "full");

        for _ in 0..100 {
            if orchestrator.status("acme").await.unwrap().last_report.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (_, status_body) = send(&app, get("/api/tenants/acme/sync/status")).await;
        assert_eq!(status_body["phase"], "idle");
        assert!(status_body["last_synced_at"].is_string());

        let (_, leads) = send(&app, get("/api/tenants/acme/leads?tags=vip&limit=2")).await;
        assert_eq!(leads["needs_sync"], false);
        assert_eq!(leads["total"], 4);
        assert_eq!(leads["leads"].as_array().unwrap().len(), 2);

        let (_, stats) = send(&app, get("/api/tenants/acme/stats")).await;
        assert_eq!(stats["needs_sync"], false);
        assert_eq!(stats["totals"]["total"], 24);
    }

    #[tokio::test]
    async fn test_unknown_tenant_not_configured() {
        let (app, _) = app().await;
        let (status, body) =
            send(&app, post("/api/tenants/globex/sync", "application/json", "")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (app, _) = app().await;

        let (status, _) = send(&app, get("/api/tenants/acme/leads?from=10&to=5")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            post("/api/tenants/acme/sync", "application/json", r#"{"mode":"sideways"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");

        let (status, _) = send(
            &app,
            post(
                "/api/tenants/acme/webhook",
                "application/x-www-form-urlencoded",
                "leads[add][0][id]=abc",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_soft_deletes() {
        let (app, orchestrator) = app().await;
        orchestrator.sync_now("acme", SyncMode::Full).await.unwrap();

        let (status, body) = send(
            &app,
            post(
                "/api/tenants/acme/webhook",
                "application/x-www-form-urlencoded",
                "leads[delete][0][id]=3&account[id]=1",
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["soft_deleted"], 1);

        // Lead 3 sat on a won stage; the total still counts it.
        let (_, stats) = send(&app, get("/api/tenants/acme/stats")).await;
        assert_eq!(stats["totals"]["total"], 24);
        assert_eq!(stats["totals"]["won"], 2);

        let (_, leads) = send(&app, get("/api/tenants/acme/leads")).await;
        assert_eq!(leads["total"], 23);
        assert_eq!(leads["total_including_deleted"], 24);
    }

    #[test]
    fn test_lead_params_split_tags() {
        let query = LeadQuery::from(LeadParams {
            tags: Some("vip, hot,,".into()),
            ..Default::default()
        });
        assert_eq!(query.tags, vec!["vip".to_string(), "hot".to_string()]);
        assert_eq!(query.page, 1);
        assert_eq!(query.limit, DEFAULT_PAGE_LIMIT);
    }
}
