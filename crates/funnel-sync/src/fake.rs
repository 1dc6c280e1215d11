//! # Fake CRM
//!
//! In-memory [`HttpTransport`] that answers the Kommo v4 endpoints the client
//! uses. Serves tests and the API's demo mode.
//!
//! ## Behavior
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FakeCrm                                        │
//! │                                                                         │
//! │  request ──► scripted failure queue ──► non-empty? pop and answer it   │
//! │                    │ empty                                              │
//! │                    ▼                                                    │
//! │              page failure for ?page=N ──► answer it (every time)        │
//! │                    │ none                                               │
//! │                    ▼                                                    │
//! │  /api/v4/leads            filtered listing, `limit` per page,          │
//! │                           `_links.next` while more remain, 204 at end  │
//! │  /api/v4/leads/{id}       detail override or stored lead, else 404     │
//! │  /api/v4/leads/pipelines  configured pipelines                         │
//! │                                                                         │
//! │  Every request is logged, failed or not.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use funnel_core::{Lead, Pipeline, Stage, StageType, Tag};

use crate::protocol::{LEADS_PATH, PIPELINES_PATH};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// A scripted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Answer with this HTTP status and an error body.
    Status(u16),
    /// Produce no response at all.
    Network,
}

#[derive(Debug, Default)]
struct FakeState {
    leads: Vec<Lead>,
    details: HashMap<i64, Lead>,
    missing_details: HashSet<i64>,
    pipelines: Vec<Pipeline>,
    failures: VecDeque<Failure>,
    page_failures: HashMap<u32, Failure>,
    requests: Vec<HttpRequest>,
}

/// In-memory CRM account.
#[derive(Debug, Default)]
pub struct FakeCrm {
    state: Mutex<FakeState>,
}

impl FakeCrm {
    /// Base URL to put into credentials that point at a fake.
    pub const BASE_URL: &'static str = "https://fake.kommo.test";

    pub fn new() -> Self {
        Self::default()
    }

    /// Demo account: pipelines 100 "Sales" and 200 "Renewals" plus a small
    /// lead set spread over their stages.
    pub fn demo() -> Self {
        let sales = Pipeline::new(
            100,
            "Sales",
            vec![
                Stage::new(101, "Incoming", 10),
                Stage::new(102, "Qualified", 20),
                Stage::new(103, "Proposal", 30),
                Stage::new(104, "Closed - won", 40).with_type(StageType::Won),
                Stage::new(105, "Closed - lost", 50).with_type(StageType::Lost),
            ],
        );
        let renewals = Pipeline::new(
            200,
            "Renewals",
            vec![
                Stage::new(201, "Due", 10),
                Stage::new(202, "Renewed", 20),
                Stage::new(203, "Churned", 30),
            ],
        );

        let stages = [101, 102, 103, 104, 105, 201, 202, 203];
        let leads = (1..=24i64)
            .map(|n| {
                let status_id = stages[(n as usize) % stages.len()];
                let pipeline_id = if status_id > 200 { 200 } else { 100 };
                let mut lead = Lead::new(n, pipeline_id, status_id)
                    .with_created_at(1_700_000_000 + n * 3_600)
                    .with_updated_at(1_700_000_000 + n * 7_200);
                lead.name = Some(format!("Demo lead #{n}"));
                lead.price = Some(1_000 * n);
                lead.responsible_user_id = Some(9_000 + n % 3);
                if n % 5 == 0 {
                    lead.tags.push(Tag {
                        id: Some(1),
                        name: "vip".to_string(),
                    });
                }
                lead
            })
            .collect();

        Self::new().with_pipelines(vec![sales, renewals]).with_leads(leads)
    }

    // =========================================================================
    // Builders
    // =========================================================================

    pub fn with_leads(self, leads: Vec<Lead>) -> Self {
        self.lock().leads = leads;
        self
    }

    pub fn with_pipelines(self, pipelines: Vec<Pipeline>) -> Self {
        self.lock().pipelines = pipelines;
        self
    }

    /// Answers by-id requests for this lead with `lead` instead of the
    /// listing record.
    pub fn with_detail(self, lead: Lead) -> Self {
        if let Some(id) = lead.valid_id() {
            self.lock().details.insert(id, lead);
        }
        self
    }

    /// Makes by-id requests for `id` answer 404 while it stays listed.
    pub fn without_detail(self, id: i64) -> Self {
        self.lock().missing_details.insert(id);
        self
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Inserts or replaces a lead by id.
    pub fn upsert_lead(&self, lead: Lead) {
        let mut state = self.lock();
        match lead
            .valid_id()
            .and_then(|id| state.leads.iter().position(|l| l.valid_id() == Some(id)))
        {
            Some(index) => state.leads[index] = lead,
            None => state.leads.push(lead),
        }
    }

    /// Removes a lead entirely (hard delete upstream).
    pub fn remove_lead(&self, id: i64) {
        self.lock().leads.retain(|l| l.valid_id() != Some(id));
    }

    /// Queues `times` copies of `failure` for the next requests.
    pub fn fail_next(&self, failure: Failure, times: usize) {
        let mut state = self.lock();
        for _ in 0..times {
            state.failures.push_back(failure);
        }
    }

    /// Makes every request for listing page `page` fail.
    pub fn fail_page(&self, page: u32, failure: Failure) {
        self.lock().page_failures.insert(page, failure);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.page_failures.clear();
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn lead_count(&self) -> usize {
        self.lock().leads.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A panic while holding the lock only happens inside a failing test.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// =============================================================================
// Request Handling
// =============================================================================

#[async_trait]
impl HttpTransport for FakeCrm {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        let path = url::Url::parse(&request.url)
            .map(|u| u.path().to_string())
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let page_failure = if path == LEADS_PATH {
            request
                .query_value("page")
                .and_then(|p| p.parse::<u32>().ok())
                .and_then(|p| state.page_failures.get(&p).copied())
        } else {
            None
        };

        if let Some(failure) = state.failures.pop_front().or(page_failure) {
            return match failure {
                Failure::Status(status) => Ok(HttpResponse::new(
                    status,
                    json!({ "status": status, "title": "scripted failure" }).to_string(),
                )),
                Failure::Network => Err(TransportError::Connect("scripted network failure".into())),
            };
        }

        if path == LEADS_PATH {
            Ok(list_leads(&state, request))
        } else if path == PIPELINES_PATH {
            Ok(list_pipelines(&state))
        } else if let Some(id) = path
            .strip_prefix(LEADS_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|id| id.parse::<i64>().ok())
        {
            Ok(lead_detail(&state, id))
        } else {
            Ok(HttpResponse::new(404, ""))
        }
    }
}

fn query_i64(request: &HttpRequest, key: &str) -> Option<i64> {
    request.query_value(key).and_then(|v| v.parse().ok())
}

fn list_leads(state: &FakeState, request: &HttpRequest) -> HttpResponse {
    let page = query_i64(request, "page").unwrap_or(1).max(1) as usize;
    let limit = query_i64(request, "limit").unwrap_or(250).max(1) as usize;
    let updated_from = query_i64(request, "filter[updated_at][from]");
    let created_from = query_i64(request, "filter[created_at][from]");
    let created_to = query_i64(request, "filter[created_at][to]");
    let pipeline = query_i64(request, "filter[pipeline_id][]");
    let owner = query_i64(request, "filter[responsible_user_id][]");

    let matching: Vec<&Lead> = state
        .leads
        .iter()
        .filter(|l| updated_from.map_or(true, |ts| l.updated_at >= ts))
        .filter(|l| created_from.map_or(true, |ts| l.created_at >= ts))
        .filter(|l| created_to.map_or(true, |ts| l.created_at <= ts))
        .filter(|l| pipeline.map_or(true, |id| l.pipeline_id == id))
        .filter(|l| owner.map_or(true, |id| l.responsible_user_id == Some(id)))
        .collect();

    let start = (page - 1) * limit;
    if start >= matching.len() {
        return HttpResponse::new(204, "");
    }

    let end = (start + limit).min(matching.len());
    let leads: Vec<Value> = matching[start..end].iter().map(|l| lead_json(l)).collect();

    let mut links = json!({
        "self": { "href": format!("{LEADS_PATH}?page={page}") }
    });
    if end < matching.len() {
        links["next"] = json!({ "href": format!("{LEADS_PATH}?page={}", page + 1) });
    }

    HttpResponse::new(
        200,
        json!({
            "_page": page,
            "_links": links,
            "_embedded": { "leads": leads }
        })
        .to_string(),
    )
}

fn lead_detail(state: &FakeState, id: i64) -> HttpResponse {
    if state.missing_details.contains(&id) {
        return HttpResponse::new(404, "");
    }

    let lead = state
        .details
        .get(&id)
        .or_else(|| state.leads.iter().find(|l| l.valid_id() == Some(id)));

    match lead {
        Some(lead) => HttpResponse::new(200, lead_json(lead).to_string()),
        None => HttpResponse::new(404, ""),
    }
}

fn list_pipelines(state: &FakeState) -> HttpResponse {
    let pipelines: Vec<Value> = state
        .pipelines
        .iter()
        .map(|p| {
            let statuses: Vec<Value> = p
                .stages
                .iter()
                .map(|s| {
                    let kind = match s.stage_type {
                        StageType::Won => json!("won"),
                        StageType::Lost => json!("lost"),
                        StageType::Unspecified => json!(0),
                    };
                    json!({ "id": s.id, "name": s.name, "sort": s.sort_order, "type": kind })
                })
                .collect();
            json!({
                "id": p.id,
                "name": p.name,
                "sort": p.sort_order,
                "_embedded": { "statuses": statuses }
            })
        })
        .collect();

    HttpResponse::new(
        200,
        json!({ "_embedded": { "pipelines": pipelines } }).to_string(),
    )
}

/// Renders a lead the way the CRM sends it.
fn lead_json(lead: &Lead) -> Value {
    let tags: Vec<Value> = lead
        .tags
        .iter()
        .map(|t| json!({ "id": t.id, "name": t.name }))
        .collect();

    json!({
        "id": lead.id,
        "name": lead.name,
        "price": lead.price,
        "responsible_user_id": lead.responsible_user_id,
        "pipeline_id": lead.pipeline_id,
        "status_id": lead.status_id,
        "is_deleted": lead.is_deleted,
        "created_at": lead.created_at,
        "updated_at": lead.updated_at,
        "closed_at": lead.closed_at,
        "custom_fields_values": lead.custom_fields,
        "_embedded": { "tags": tags }
    })
}
