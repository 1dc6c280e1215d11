//! # CRM Wire Protocol
//!
//! Request paths, query rendering and response models for the Kommo v4 API.
//!
//! ## Endpoints Used
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Kommo v4 (read-only subset)                        │
//! │                                                                         │
//! │  LIST LEADS                                                            │
//! │  ──────────                                                            │
//! │  GET /api/v4/leads?page=N&limit=250&filter[updated_at][from]=…         │
//! │      200 { "_links": { "next": { "href": … } },                        │
//! │            "_embedded": { "leads": [ … ] } }                           │
//! │      204 (no body) → no more leads                                     │
//! │                                                                         │
//! │  ONE LEAD                                                              │
//! │  ────────                                                              │
//! │  GET /api/v4/leads/{id}?with=contacts                                  │
//! │      200 { "id": …, "custom_fields_values": [ … ], … }                 │
//! │      404 / 204 → gone upstream                                         │
//! │                                                                         │
//! │  PIPELINES                                                             │
//! │  ─────────                                                             │
//! │  GET /api/v4/leads/pipelines                                           │
//! │      200 { "_embedded": { "pipelines": [                               │
//! │              { "id", "name", "sort",                                   │
//! │                "_embedded": { "statuses": [ {id,name,sort,type} ] } }  │
//! │          ] } }                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Leniency
//! Upstream payloads are not trusted to be well-typed. Lead ids arrive as
//! numbers, numeric strings, or not at all; a missing or unparsable id
//! becomes `None` and the lead is rejected later by validation instead of
//! failing the whole page. Each listed lead is decoded on its own, so a
//! record with a broken field costs that record only.

use serde::{Deserialize, Serialize};
use tracing::debug;

use funnel_core::{Lead, Pipeline, Stage, StageType, Tag};

use crate::error::SyncResult;

pub const LEADS_PATH: &str = "/api/v4/leads";
pub const PIPELINES_PATH: &str = "/api/v4/leads/pipelines";

/// Path of a single lead.
pub fn lead_path(id: i64) -> String {
    format!("{LEADS_PATH}/{id}")
}

// =============================================================================
// Remote Listing Filters
// =============================================================================

/// Server-side filters for the lead listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLeadQuery {
    /// Only leads updated at or after this unix time (incremental sync).
    pub updated_since: Option<i64>,
    pub created_from: Option<i64>,
    pub created_to: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub responsible_user_id: Option<i64>,
}

impl RemoteLeadQuery {
    /// Everything (full sync).
    pub fn all() -> Self {
        Self::default()
    }

    /// Leads changed since `ts` (incremental sync).
    pub fn updated_since(ts: i64) -> Self {
        RemoteLeadQuery {
            updated_since: Some(ts),
            ..Default::default()
        }
    }

    /// Renders the filters as Kommo `filter[...]` query parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(ts) = self.updated_since {
            params.push(("filter[updated_at][from]".to_string(), ts.to_string()));
        }
        if let Some(ts) = self.created_from {
            params.push(("filter[created_at][from]".to_string(), ts.to_string()));
        }
        if let Some(ts) = self.created_to {
            params.push(("filter[created_at][to]".to_string(), ts.to_string()));
        }
        if let Some(id) = self.pipeline_id {
            params.push(("filter[pipeline_id][]".to_string(), id.to_string()));
        }
        if let Some(id) = self.responsible_user_id {
            params.push(("filter[responsible_user_id][]".to_string(), id.to_string()));
        }
        params
    }

    /// True when no filter narrows the listing.
    pub fn is_unfiltered(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Lead Models
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddedLeads {
    /// Raw records; see [`lead_from_value`].
    #[serde(default)]
    pub leads: Vec<serde_json::Value>,
}

/// One page of the lead listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadListResponse {
    #[serde(default, rename = "_links")]
    pub links: Links,
    #[serde(default, rename = "_embedded")]
    pub embedded: EmbeddedLeads,
}

impl LeadListResponse {
    pub fn has_next(&self) -> bool {
        self.links.next.is_some()
    }

    pub fn into_leads(self) -> Vec<Lead> {
        self.embedded.leads.into_iter().map(lead_from_value).collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiLeadEmbedded {
    #[serde(default)]
    pub tags: Vec<ApiTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTag {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: String,
}

/// A lead as the CRM sends it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiLead {
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: serde_json::Value,
    #[serde(default)]
    pub responsible_user_id: serde_json::Value,
    #[serde(default)]
    pub pipeline_id: serde_json::Value,
    #[serde(default)]
    pub status_id: serde_json::Value,
    #[serde(default)]
    pub is_deleted: Option<bool>,
    #[serde(default)]
    pub created_at: serde_json::Value,
    #[serde(default)]
    pub updated_at: serde_json::Value,
    #[serde(default)]
    pub closed_at: serde_json::Value,
    #[serde(default)]
    pub custom_fields_values: serde_json::Value,
    #[serde(default, rename = "_embedded")]
    pub embedded: ApiLeadEmbedded,
}

/// Reads an integer from a number or a numeric string.
fn lenient_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A lead that could not be read. Validation rejects it for the missing id.
fn malformed_lead() -> Lead {
    Lead {
        id: None,
        ..Lead::new(0, 0, 0)
    }
}

/// Converts one listed record, never failing.
///
/// A record that is not an object of the expected shape, or that has no
/// readable pipeline or stage, comes back without an id.
pub fn lead_from_value(value: serde_json::Value) -> Lead {
    match serde_json::from_value::<ApiLead>(value) {
        Ok(api) => api.into(),
        Err(e) => {
            debug!(error = %e, "Unreadable lead record");
            malformed_lead()
        }
    }
}

impl From<ApiLead> for Lead {
    fn from(api: ApiLead) -> Self {
        let (Some(pipeline_id), Some(status_id)) =
            (lenient_i64(&api.pipeline_id), lenient_i64(&api.status_id))
        else {
            debug!(id = %api.id, "Lead without a readable pipeline or stage");
            return malformed_lead();
        };

        let created_at = lenient_i64(&api.created_at).unwrap_or_default();
        Lead {
            id: lenient_i64(&api.id),
            name: api.name,
            price: lenient_i64(&api.price),
            responsible_user_id: lenient_i64(&api.responsible_user_id),
            pipeline_id,
            status_id,
            is_deleted: api.is_deleted,
            created_at,
            updated_at: lenient_i64(&api.updated_at).unwrap_or(created_at),
            closed_at: lenient_i64(&api.closed_at),
            custom_fields: api.custom_fields_values,
            tags: api
                .embedded
                .tags
                .into_iter()
                .map(|t| Tag {
                    id: t.id,
                    name: t.name,
                })
                .collect(),
        }
    }
}

// =============================================================================
// Pipeline Models
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineListResponse {
    #[serde(default, rename = "_embedded")]
    pub embedded: EmbeddedPipelines,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddedPipelines {
    #[serde(default)]
    pub pipelines: Vec<ApiPipeline>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPipeline {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sort: i64,
    #[serde(default, rename = "_embedded")]
    pub embedded: EmbeddedStatuses,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddedStatuses {
    #[serde(default)]
    pub statuses: Vec<ApiStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiStatus {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sort: i64,
    /// Some accounts send `"won"` / `"lost"`; numeric Kommo types carry no
    /// outcome and are ignored.
    #[serde(default, rename = "type")]
    pub kind: serde_json::Value,
}

impl ApiStatus {
    fn stage_type(&self) -> StageType {
        match self.kind.as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("won") | Some("success") => StageType::Won,
            Some("lost") | Some("fail") | Some("failure") => StageType::Lost,
            _ => StageType::Unspecified,
        }
    }
}

impl From<ApiPipeline> for Pipeline {
    fn from(api: ApiPipeline) -> Self {
        let stages = api
            .embedded
            .statuses
            .iter()
            .map(|s| Stage::new(s.id, s.name.clone(), s.sort).with_type(s.stage_type()))
            .collect();

        let mut pipeline = Pipeline::new(api.id, api.name, stages);
        pipeline.sort_order = api.sort;
        pipeline
    }
}

// =============================================================================
// Decoding Helpers
// =============================================================================

/// Decodes a listing page body. An empty body is an empty page.
pub fn decode_lead_page(body: &str) -> SyncResult<LeadListResponse> {
    if body.trim().is_empty() {
        return Ok(LeadListResponse::default());
    }
    Ok(serde_json::from_str(body)?)
}

pub fn decode_lead(body: &str) -> SyncResult<Lead> {
    let api: ApiLead = serde_json::from_str(body)?;
    Ok(api.into())
}

pub fn decode_pipelines(body: &str) -> SyncResult<Vec<Pipeline>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: PipelineListResponse = serde_json::from_str(body)?;
    Ok(response
        .embedded
        .pipelines
        .into_iter()
        .map(Pipeline::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_params() {
        let q = RemoteLeadQuery {
            updated_since: Some(1700000000),
            pipeline_id: Some(7),
            ..Default::default()
        };
        let params = q.to_params();
        assert_eq!(
            params,
            vec![
                ("filter[updated_at][from]".to_string(), "1700000000".to_string()),
                ("filter[pipeline_id][]".to_string(), "7".to_string()),
            ]
        );
        assert!(RemoteLeadQuery::all().to_params().is_empty());
        assert!(RemoteLeadQuery::all().is_unfiltered());
    }

    #[test]
    fn test_decode_page() {
        let body = json!({
            "_links": { "next": { "href": "https://x/api/v4/leads?page=2" } },
            "_embedded": { "leads": [
                { "id": 1, "pipeline_id": 10, "status_id": 100, "created_at": 5, "updated_at": 6,
                  "_embedded": { "tags": [ { "id": 3, "name": "vip" } ] } },
                { "id": "2", "pipeline_id": 10, "status_id": 101, "price": 1500.0 },
                { "pipeline_id": 10, "status_id": 101 },
                { "id": "abc", "pipeline_id": 10, "status_id": 101 }
            ] }
        })
        .to_string();

        let page = decode_lead_page(&body).unwrap();
        assert!(page.has_next());

        let leads = page.into_leads();
        assert_eq!(leads[0].id, Some(1));
        assert!(leads[0].has_tag("vip"));
        assert_eq!(leads[1].id, Some(2));
        assert_eq!(leads[1].price, Some(1500));
        assert_eq!(leads[2].id, None);
        assert_eq!(leads[3].id, None);
    }

    #[test]
    fn test_bad_field_drops_only_that_lead() {
        let body = json!({
            "_embedded": { "leads": [
                { "id": 1, "pipeline_id": 10, "status_id": 100, "updated_at": "7" },
                { "id": 2, "pipeline_id": null, "status_id": 100 },
                { "id": 3, "pipeline_id": 10, "status_id": 100, "is_deleted": "yes" },
                { "id": 4, "pipeline_id": 10, "status_id": 100, "closed_at": null,
                  "responsible_user_id": "55" },
                "not a lead"
            ] }
        })
        .to_string();

        let leads = decode_lead_page(&body).unwrap().into_leads();
        assert_eq!(leads.len(), 5);
        assert_eq!(leads[0].id, Some(1));
        assert_eq!(leads[0].updated_at, 7);
        assert_eq!(leads[1].id, None);
        assert_eq!(leads[2].id, None);
        assert_eq!(leads[3].id, Some(4));
        assert_eq!(leads[3].responsible_user_id, Some(55));
        assert_eq!(leads[3].closed_at, None);
        assert_eq!(leads[4].id, None);

        let rejected = leads
            .iter()
            .filter(|l| funnel_core::validation::validate_lead(l).is_err())
            .count();
        assert_eq!(rejected, 3);
    }

    #[test]
    fn test_decode_empty_page() {
        let page = decode_lead_page("").unwrap();
        assert!(!page.has_next());
        assert!(page.embedded.leads.is_empty());
    }

    #[test]
    fn test_updated_at_defaults_to_created_at() {
        let lead = decode_lead(r#"{"id": 4, "pipeline_id": 1, "status_id": 2, "created_at": 99}"#)
            .unwrap();
        assert_eq!(lead.updated_at, 99);
        assert!(lead.custom_fields.is_null());
    }

    #[test]
    fn test_decode_pipelines() {
        let body = json!({
            "_embedded": { "pipelines": [ {
                "id": 10, "name": "Sales", "sort": 2,
                "_embedded": { "statuses": [
                    { "id": 100, "name": "New", "sort": 10, "type": 1 },
                    { "id": 142, "name": "Closed - won", "sort": 10000, "type": "won" },
                    { "id": 143, "name": "Closed - lost", "sort": 11000 }
                ] }
            } ] }
        })
        .to_string();

        let pipelines = decode_pipelines(&body).unwrap();
        assert_eq!(pipelines.len(), 1);
        let p = &pipelines[0];
        assert_eq!(p.sort_order, 2);
        assert_eq!(p.stages.len(), 3);
        assert_eq!(p.stages[0].stage_type, StageType::Unspecified);
        assert_eq!(p.stages[1].stage_type, StageType::Won);
        assert!(p.stages.iter().all(|s| s.pipeline_id == 10));
    }

    #[test]
    fn test_malformed_body_is_decode_error() {
        let err = decode_lead_page("{not json").unwrap_err();
        assert!(matches!(err, crate::error::SyncError::Decode(_)));
    }
}
