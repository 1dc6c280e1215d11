//! # CRM Client
//!
//! Rate-limited, retrying, paginating client for one tenant's CRM account.
//!
//! ## Request Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One Outbound Call                                │
//! │                                                                         │
//! │  credentials() ──► AuthMissing if the tenant has none                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────┐   wait until min_interval has passed since the previous  │
//! │  │  pace    │   call started (per client, across all endpoints)        │
//! │  └────┬─────┘                                                          │
//! │       ▼                                                                 │
//! │  ┌──────────┐   2xx / 204 / 4xx ─────────────────────► caller          │
//! │  │ transport│                                                          │
//! │  └────┬─────┘   429 / 5xx / no response                                │
//! │       ▼                                                                 │
//! │  ┌──────────┐   attempt <= max_retries: sleep 1s, 2s, 4s ... and retry │
//! │  │ backoff  │   exhausted: RateLimited / Upstream / Network            │
//! │  └──────────┘                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pagination
//! `fetch_all` walks pages until the response has no `_links.next` or comes
//! back empty. A failure on page 1 fails the call; a failure on a later page
//! stops the walk and returns what was collected with `complete = false`, so
//! the caller must not treat the set as authoritative for deletions.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use funnel_core::{Lead, Pipeline};

use crate::config::ClientSettings;
use crate::credentials::{CredentialCache, CredentialResolver};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    decode_lead, decode_lead_page, decode_pipelines, lead_path, RemoteLeadQuery, LEADS_PATH,
    PIPELINES_PATH,
};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Upstream error bodies are cut to this many bytes in errors and logs.
const MAX_ERROR_BODY: usize = 512;

// =============================================================================
// Results
// =============================================================================

/// One decoded listing page.
#[derive(Debug, Clone, Default)]
pub struct LeadPage {
    pub page: u32,
    pub leads: Vec<Lead>,
    pub has_next: bool,
}

/// Result of walking every listing page.
#[derive(Debug, Clone, Default)]
pub struct LeadFetch {
    pub leads: Vec<Lead>,
    /// False when a page after the first failed and the walk stopped early.
    pub complete: bool,
    /// Pages successfully fetched.
    pub pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryReason {
    RateLimited,
    ServerError,
    Network,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::RateLimited => write!(f, "rate_limited"),
            RetryReason::ServerError => write!(f, "server_error"),
            RetryReason::Network => write!(f, "network"),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// CRM client bound to one tenant.
///
/// Holds the tenant's credential cache and pacer; build one per tenant and
/// reuse it for every call so pacing applies across all of them.
pub struct CrmClient {
    tenant_id: String,
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialCache,
    settings: ClientSettings,
    /// Start time of the previous outbound call.
    last_call: Mutex<Option<Instant>>,
}

impl CrmClient {
    pub fn new(
        tenant_id: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        resolver: Arc<dyn CredentialResolver>,
        settings: ClientSettings,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let credentials = CredentialCache::new(tenant_id.clone(), resolver, settings.token_ttl());

        CrmClient {
            tenant_id,
            transport,
            credentials,
            settings,
            last_call: Mutex::new(None),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    // =========================================================================
    // Leads
    // =========================================================================

    /// Fetches one listing page (1-based).
    pub async fn fetch_page(&self, query: &RemoteLeadQuery, page: u32) -> SyncResult<LeadPage> {
        let mut params = vec![
            ("page".to_string(), page.to_string()),
            ("limit".to_string(), self.settings.page_size.to_string()),
        ];
        params.extend(query.to_params());

        let response = self.get(LEADS_PATH, params).await?;
        if response.status == 204 {
            return Ok(LeadPage {
                page,
                leads: Vec::new(),
                has_next: false,
            });
        }

        let response = ensure_success(response)?;
        let decoded = decode_lead_page(&response.body)?;
        let has_next = decoded.has_next() && !decoded.embedded.leads.is_empty();

        Ok(LeadPage {
            page,
            leads: decoded.into_leads(),
            has_next,
        })
    }

    /// Walks every listing page.
    pub async fn fetch_all(&self, query: &RemoteLeadQuery) -> SyncResult<LeadFetch> {
        let mut fetch = LeadFetch::default();
        let mut page = 1u32;

        loop {
            match self.fetch_page(query, page).await {
                Ok(result) => {
                    fetch.pages += 1;
                    let count = result.leads.len();
                    fetch.leads.extend(result.leads);

                    debug!(tenant_id = %self.tenant_id, page, count, "Fetched lead page");

                    if !result.has_next || count == 0 {
                        fetch.complete = true;
                        break;
                    }
                    page += 1;
                }
                Err(e) if page == 1 => return Err(e),
                Err(e) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        page,
                        collected = fetch.leads.len(),
                        error = %e,
                        "Lead listing stopped early; returning partial result"
                    );
                    break;
                }
            }
        }

        info!(
            tenant_id = %self.tenant_id,
            leads = fetch.leads.len(),
            pages = fetch.pages,
            complete = fetch.complete,
            "Lead listing finished"
        );

        Ok(fetch)
    }

    /// Fetches a single lead. `None` when it no longer exists upstream.
    pub async fn fetch_by_id(&self, id: i64) -> SyncResult<Option<Lead>> {
        let response = self.get(&lead_path(id), Vec::new()).await?;
        if matches!(response.status, 204 | 404) {
            return Ok(None);
        }

        let response = ensure_success(response)?;
        Ok(Some(decode_lead(&response.body)?))
    }

    /// Lists leads, then re-fetches each one by id for the full record.
    ///
    /// By-id calls run `enrich_concurrency` at a time with `enrich_delay`
    /// between batches. A lead whose detail call fails or 404s keeps its
    /// listing record.
    pub async fn fetch_all_with_full_details(
        &self,
        query: &RemoteLeadQuery,
    ) -> SyncResult<LeadFetch> {
        let listing = self.fetch_all(query).await?;
        let batch_size = self.settings.enrich_concurrency.max(1);
        let mut enriched = Vec::with_capacity(listing.leads.len());
        let mut fallbacks = 0usize;

        let batches: Vec<&[Lead]> = listing.leads.chunks(batch_size).collect();
        let batch_count = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let results = join_all(batch.iter().map(|lead| self.detail_or_listing(lead))).await;
            for (lead, fell_back) in results {
                if fell_back {
                    fallbacks += 1;
                }
                enriched.push(lead);
            }

            if index + 1 < batch_count {
                tokio::time::sleep(self.settings.enrich_delay()).await;
            }
        }

        if fallbacks > 0 {
            warn!(
                tenant_id = %self.tenant_id,
                fallbacks,
                "Some leads kept their listing record"
            );
        }

        Ok(LeadFetch {
            leads: enriched,
            complete: listing.complete,
            pages: listing.pages,
        })
    }

    /// Returns the detailed record, or the listing record and `true`.
    async fn detail_or_listing(&self, lead: &Lead) -> (Lead, bool) {
        let Some(id) = lead.valid_id() else {
            return (lead.clone(), false);
        };

        match self.fetch_by_id(id).await {
            Ok(Some(full)) if full.valid_id().is_some() => (full, false),
            Ok(Some(_)) => {
                debug!(tenant_id = %self.tenant_id, lead_id = id, "Lead detail unreadable");
                (lead.clone(), true)
            }
            Ok(None) => {
                debug!(tenant_id = %self.tenant_id, lead_id = id, "Lead detail missing upstream");
                (lead.clone(), true)
            }
            Err(e) => {
                debug!(tenant_id = %self.tenant_id, lead_id = id, error = %e, "Lead detail failed");
                (lead.clone(), true)
            }
        }
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Fetches every pipeline with its stages.
    pub async fn fetch_pipelines(&self) -> SyncResult<Vec<Pipeline>> {
        let response = self.get(PIPELINES_PATH, Vec::new()).await?;
        if response.status == 204 {
            return Ok(Vec::new());
        }

        let response = ensure_success(response)?;
        decode_pipelines(&response.body)
    }

    // =========================================================================
    // Request Plumbing
    // =========================================================================

    /// Paced, retried GET.
    ///
    /// Returns every response that is not worth retrying, including 4xx.
    async fn get(&self, path: &str, query: Vec<(String, String)>) -> SyncResult<HttpResponse> {
        let credentials = self.credentials.get().await?;
        let request = HttpRequest {
            url: credentials.url(path)?,
            query,
            bearer_token: credentials.access_token,
        };

        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.pace().await;

            let (reason, err) = match self.transport.get(&request).await {
                Ok(response) if response.status == 429 => (
                    RetryReason::RateLimited,
                    SyncError::RateLimited { attempts: attempt },
                ),
                Ok(response) if response.status >= 500 => (
                    RetryReason::ServerError,
                    SyncError::Upstream {
                        status: response.status,
                        body: truncate(response.body),
                    },
                ),
                Ok(response) => return Ok(response),
                Err(e) => (RetryReason::Network, SyncError::from(e)),
            };

            if attempt > self.settings.max_retries {
                warn!(
                    tenant_id = %self.tenant_id,
                    path,
                    attempts = attempt,
                    retry_reason = %reason,
                    error = %err,
                    "CRM request failed after retries"
                );
                return Err(err);
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or_else(|| self.settings.max_backoff());

            warn!(
                tenant_id = %self.tenant_id,
                path,
                attempt,
                retry_reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Retrying CRM request"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Waits until `min_interval` has passed since the previous call started.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.settings.min_interval()).await;
        }
        *last = Some(Instant::now());
    }

    /// Deterministic doubling backoff starting at `base_backoff`.
    fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.settings.base_backoff(),
            max_interval: self.settings.max_backoff(),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// Converts a non-2xx response into `Upstream`.
fn ensure_success(response: HttpResponse) -> SyncResult<HttpResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(SyncError::Upstream {
            status: response.status,
            body: truncate(response.body),
        })
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

impl std::fmt::Debug for CrmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmClient")
            .field("tenant_id", &self.tenant_id)
            .field("min_interval", &Duration::from_millis(self.settings.min_interval_ms))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CrmCredentials, StaticCredentialResolver};
    use crate::fake::{FakeCrm, Failure};

    fn resolver() -> Arc<StaticCredentialResolver> {
        Arc::new(
            StaticCredentialResolver::new()
                .with_tenant("acme", CrmCredentials::new(FakeCrm::BASE_URL, "tok")),
        )
    }

    fn client(fake: &Arc<FakeCrm>, settings: ClientSettings) -> CrmClient {
        CrmClient::new("acme", fake.clone(), resolver(), settings)
    }

    fn settings(page_size: u32) -> ClientSettings {
        ClientSettings {
            page_size,
            ..Default::default()
        }
    }

    fn leads(n: i64) -> Vec<Lead> {
        (1..=n)
            .map(|i| Lead::new(i, 100, 101).with_updated_at(1_000 + i))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_all_walks_pages() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(5)));
        let client = client(&fake, settings(2));

        let fetch = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();

        assert!(fetch.complete);
        assert_eq!(fetch.pages, 3);
        assert_eq!(fetch.leads.len(), 5);

        let requests = fake.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].query_value("page"), Some("3"));
        assert_eq!(requests[0].query_value("limit"), Some("2"));
        assert_eq!(requests[0].bearer_token, "tok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_account_is_complete() {
        let fake = Arc::new(FakeCrm::new());
        let client = client(&fake, settings(250));

        let fetch = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();
        assert!(fetch.complete);
        assert!(fetch.leads.is_empty());
        assert_eq!(fake.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_paced() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(6)));
        let client = client(&fake, settings(2));

        let started = Instant::now();
        client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();

        // Three calls: the second and third each wait 200 ms.
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_three_rate_limits() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(3)));
        fake.fail_next(Failure::Status(429), 3);
        let client = client(&fake, settings(250));

        let started = Instant::now();
        let fetch = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();

        assert!(fetch.complete);
        assert_eq!(fetch.leads.len(), 3);
        assert_eq!(fake.request_count(), 4);
        // 1 s + 2 s + 4 s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_rate_limits_on_first_page_fail() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(3)));
        fake.fail_next(Failure::Status(429), 4);
        let client = client(&fake, settings(250));

        let err = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { attempts: 4 }));
        assert_eq!(fake.request_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_page_failure_keeps_earlier_pages() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(5)));
        fake.fail_page(2, Failure::Status(429));
        let client = client(&fake, settings(2));

        let fetch = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();

        assert!(!fetch.complete);
        assert_eq!(fetch.pages, 1);
        assert_eq!(fetch.leads.len(), 2);
        // Page 1 once, page 2 four times.
        assert_eq!(fake.request_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_and_network_are_retried() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(1)));
        fake.fail_next(Failure::Status(503), 1);
        fake.fail_next(Failure::Network, 1);
        let client = client(&fake, settings(250));

        let fetch = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap();
        assert_eq!(fetch.leads.len(), 1);
        assert_eq!(fake.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_exhaustion_surfaces_network() {
        let fake = Arc::new(FakeCrm::new());
        fake.fail_next(Failure::Network, 10);
        let client = client(&fake, settings(250));

        let err = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let fake = Arc::new(FakeCrm::new());
        fake.fail_next(Failure::Status(401), 1);
        let client = client(&fake, settings(250));

        let err = client.fetch_all(&RemoteLeadQuery::all()).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream { status: 401, .. }));
        assert_eq!(fake.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials() {
        let fake = Arc::new(FakeCrm::new());
        let client = CrmClient::new(
            "globex",
            fake.clone(),
            resolver(),
            ClientSettings::default(),
        );

        let err = client.fetch_pipelines().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthMissing { .. }));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_filter_is_sent() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(4)));
        let client = client(&fake, settings(250));

        let fetch = client
            .fetch_all(&RemoteLeadQuery::updated_since(1_003))
            .await
            .unwrap();

        assert_eq!(fetch.leads.len(), 2);
        assert_eq!(
            fake.requests()[0].query_value("filter[updated_at][from]"),
            Some("1003")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_by_id() {
        let fake = Arc::new(FakeCrm::new().with_leads(leads(2)));
        let client = client(&fake, settings(250));

        let lead = client.fetch_by_id(2).await.unwrap().unwrap();
        assert_eq!(lead.id, Some(2));
        assert!(client.fetch_by_id(99).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_details_fall_back_to_listing() {
        let mut detailed = Lead::new(1, 100, 101).with_updated_at(1_001);
        detailed.name = Some("Full record".to_string());

        let fake = Arc::new(
            FakeCrm::new()
                .with_leads(leads(4))
                .with_detail(detailed)
                .without_detail(3),
        );
        let client = client(&fake, settings(250));

        let fetch = client
            .fetch_all_with_full_details(&RemoteLeadQuery::all())
            .await
            .unwrap();

        assert_eq!(fetch.leads.len(), 4);
        assert_eq!(fetch.leads[0].name.as_deref(), Some("Full record"));
        assert_eq!(fetch.leads[2].id, Some(3));
        // One listing call plus one detail call per lead.
        assert_eq!(fake.request_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_pipelines() {
        let fake = Arc::new(FakeCrm::demo());
        let client = client(&fake, settings(250));

        let pipelines = client.fetch_pipelines().await.unwrap();
        assert_eq!(pipelines.len(), 2);
        assert!(pipelines[0].has_stage(104));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(400);
        let cut = truncate(body);
        assert!(cut.len() <= MAX_ERROR_BODY);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
