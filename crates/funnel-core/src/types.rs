//! # Domain Types
//!
//! Core domain types used throughout Funnel.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Lead       │   │    Pipeline     │   │      Stage      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (CRM id)    │   │  id             │   │  id (per pipe)  │       │
//! │  │  pipeline_id ───┼──►│  name           │   │  name           │       │
//! │  │  status_id   ───┼───┼──────────────── ┼──►│  sort_order     │       │
//! │  │  is_deleted     │   │  stages[] ──────┼──►│  stage_type     │       │
//! │  │  updated_at     │   └─────────────────┘   └─────────────────┘       │
//! │  └────────┬────────┘                                                   │
//! │           │ + tenant_id, synced_at, last_modified_at                   │
//! │           ▼                                                             │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   StoredLead    │   │    LeadQuery    │   │   SyncReport    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! A lead is identified by the pair (`tenant_id`, `id`). The CRM id is only
//! unique inside one tenant's CRM account, and a stage id is only unique
//! inside its own pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

// =============================================================================
// Lead
// =============================================================================

/// A tag attached to a lead in the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
}

/// A sales opportunity as delivered by the CRM.
///
/// `id` is optional because the upstream occasionally delivers records
/// without a usable id; those are rejected by validation before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// External CRM id. Valid only when positive.
    pub id: Option<i64>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub price: Option<i64>,

    /// Owner of the lead in the CRM.
    #[serde(default)]
    pub responsible_user_id: Option<i64>,

    pub pipeline_id: i64,

    /// Stage id, meaningful only together with `pipeline_id`.
    pub status_id: i64,

    /// `None` is treated exactly like `Some(false)`.
    #[serde(default)]
    pub is_deleted: Option<bool>,

    /// Unix seconds.
    pub created_at: i64,

    /// Unix seconds. Drives the "newer wins" rule on upsert.
    pub updated_at: i64,

    #[serde(default)]
    pub closed_at: Option<i64>,

    /// Opaque CRM payload, carried through unchanged.
    #[serde(default)]
    pub custom_fields: serde_json::Value,

    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Lead {
    /// Creates a minimal lead positioned in the given pipeline stage.
    pub fn new(id: i64, pipeline_id: i64, status_id: i64) -> Self {
        Lead {
            id: Some(id),
            name: None,
            price: None,
            responsible_user_id: None,
            pipeline_id,
            status_id,
            is_deleted: None,
            created_at: 0,
            updated_at: 0,
            closed_at: None,
            custom_fields: serde_json::Value::Null,
            tags: Vec::new(),
        }
    }

    /// Sets `updated_at` (builder style).
    pub fn with_updated_at(mut self, ts: i64) -> Self {
        self.updated_at = ts;
        self
    }

    /// Sets `created_at` (builder style).
    pub fn with_created_at(mut self, ts: i64) -> Self {
        self.created_at = ts;
        self
    }

    /// Marks the lead as deleted upstream (builder style).
    pub fn deleted(mut self) -> Self {
        self.is_deleted = Some(true);
        self
    }

    /// Returns the id if it is a usable positive integer.
    pub fn valid_id(&self) -> Option<i64> {
        self.id.filter(|id| *id > 0)
    }

    /// A lead is active unless it is explicitly flagged deleted.
    ///
    /// A missing flag counts as active.
    pub fn is_active(&self) -> bool {
        self.is_deleted != Some(true)
    }

    /// Returns true if the lead carries the given tag name.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }
}

// =============================================================================
// Stored Lead
// =============================================================================

/// A lead as persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLead {
    #[serde(flatten)]
    pub lead: Lead,

    /// Owning tenant.
    pub tenant_id: String,

    /// Last local write time.
    pub synced_at: DateTime<Utc>,

    /// Upstream `updated_at` as a timestamp.
    pub last_modified_at: DateTime<Utc>,
}

impl StoredLead {
    /// The stored id. Always valid for persisted rows.
    pub fn id(&self) -> i64 {
        self.lead.id.unwrap_or_default()
    }
}

// =============================================================================
// Pipelines & Stages
// =============================================================================

/// Explicit stage type reported by the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    #[default]
    Unspecified,
    Won,
    Lost,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub name: String,
    pub sort_order: i64,
    #[serde(default)]
    pub stage_type: StageType,
    #[serde(default)]
    pub pipeline_id: i64,
}

impl Stage {
    /// Creates an untyped stage.
    pub fn new(id: i64, name: impl Into<String>, sort_order: i64) -> Self {
        Stage {
            id,
            name: name.into(),
            sort_order,
            stage_type: StageType::Unspecified,
            pipeline_id: 0,
        }
    }

    /// Sets the explicit stage type (builder style).
    pub fn with_type(mut self, stage_type: StageType) -> Self {
        self.stage_type = stage_type;
        self
    }
}

/// An ordered sequence of stages (a sales funnel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Creates a pipeline, stamping `pipeline_id` onto every stage.
    pub fn new(id: i64, name: impl Into<String>, stages: Vec<Stage>) -> Self {
        let stages = stages
            .into_iter()
            .map(|mut s| {
                s.pipeline_id = id;
                s
            })
            .collect();

        Pipeline {
            id,
            name: name.into(),
            sort_order: 0,
            stages,
        }
    }

    /// Returns the stages ordered by (`sort_order`, `id`).
    pub fn ordered_stages(&self) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self.stages.iter().collect();
        stages.sort_by_key(|s| (s.sort_order, s.id));
        stages
    }

    /// Returns true if `status_id` is one of this pipeline's stages.
    pub fn has_stage(&self, status_id: i64) -> bool {
        self.stages.iter().any(|s| s.id == status_id)
    }
}

// =============================================================================
// Lead Queries
// =============================================================================

/// Which timestamp a date range filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    #[default]
    Created,
    Closed,
}

impl DateField {
    /// Column holding this timestamp in the lead store.
    pub fn column(&self) -> &'static str {
        match self {
            DateField::Created => "created_at",
            DateField::Closed => "closed_at",
        }
    }
}

/// Filters and paging for a lead listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadQuery {
    pub date_field: DateField,
    /// Inclusive lower bound, Unix seconds.
    pub from: Option<i64>,
    /// Inclusive upper bound, Unix seconds.
    pub to: Option<i64>,
    pub responsible_user_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub status_id: Option<i64>,
    /// Matches leads carrying any of these tag names.
    pub tags: Vec<String>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Default for LeadQuery {
    fn default() -> Self {
        LeadQuery {
            date_field: DateField::Created,
            from: None,
            to: None,
            responsible_user_id: None,
            pipeline_id: None,
            status_id: None,
            tags: Vec::new(),
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl LeadQuery {
    /// Row offset for the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit.min(MAX_PAGE_LIMIT))
    }
}

/// One page of stored leads plus the two totals callers need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadQueryPage {
    pub leads: Vec<StoredLead>,
    /// Active leads matching the filters.
    pub total: i64,
    /// Every lead for the tenant, soft-deleted ones included.
    pub total_including_deleted: i64,
    pub page: u32,
    pub limit: u32,
}

// =============================================================================
// Sync Report
// =============================================================================

/// Outcome of one store reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Leads handed to the store, valid or not.
    pub processed: u64,
    /// Rows inserted by this sync.
    pub created: u64,
    /// Rows updated by this sync.
    pub updated: u64,
    /// Leads skipped because the stored copy is newer.
    pub stale: u64,
    /// Rows soft-deleted by full-sync reconciliation.
    pub soft_deleted: u64,
    /// Invalid leads and writes that failed after every fallback.
    pub errors: u64,
    pub elapsed_ms: u64,
    pub full_sync: bool,
    pub started_at: DateTime<Utc>,
}

impl SyncReport {
    /// Creates an empty report stamped with the current time.
    pub fn new(full_sync: bool) -> Self {
        SyncReport {
            processed: 0,
            created: 0,
            updated: 0,
            stale: 0,
            soft_deleted: 0,
            errors: 0,
            elapsed_ms: 0,
            full_sync,
            started_at: Utc::now(),
        }
    }

    /// Rows actually written (inserted or updated).
    pub fn written(&self) -> u64 {
        self.created + self.updated
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_delete_flag_is_active() {
        let mut lead = Lead::new(1, 10, 100);
        assert!(lead.is_active());

        lead.is_deleted = Some(false);
        assert!(lead.is_active());

        lead.is_deleted = Some(true);
        assert!(!lead.is_active());
    }

    #[test]
    fn test_valid_id() {
        assert_eq!(Lead::new(7, 1, 1).valid_id(), Some(7));

        let mut lead = Lead::new(0, 1, 1);
        assert_eq!(lead.valid_id(), None);

        lead.id = Some(-3);
        assert_eq!(lead.valid_id(), None);

        lead.id = None;
        assert_eq!(lead.valid_id(), None);
    }

    #[test]
    fn test_lead_deserializes_with_missing_optionals() {
        let lead: Lead = serde_json::from_str(
            r#"{"id": 5, "pipeline_id": 1, "status_id": 2, "created_at": 10, "updated_at": 20}"#,
        )
        .unwrap();

        assert_eq!(lead.id, Some(5));
        assert_eq!(lead.is_deleted, None);
        assert!(lead.tags.is_empty());
        assert!(lead.custom_fields.is_null());
    }

    #[test]
    fn test_pipeline_new_stamps_stage_pipeline() {
        let pipeline = Pipeline::new(42, "Sales", vec![Stage::new(1, "New", 10)]);
        assert_eq!(pipeline.stages[0].pipeline_id, 42);
        assert!(pipeline.has_stage(1));
        assert!(!pipeline.has_stage(2));
    }

    #[test]
    fn test_ordered_stages_breaks_ties_by_id() {
        let pipeline = Pipeline::new(
            1,
            "P",
            vec![
                Stage::new(9, "b", 2),
                Stage::new(3, "a", 2),
                Stage::new(5, "first", 1),
            ],
        );
        let ids: Vec<i64> = pipeline.ordered_stages().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_query_offset() {
        let query = LeadQuery {
            page: 3,
            limit: 20,
            ..Default::default()
        };
        assert_eq!(query.offset(), 40);
        assert_eq!(LeadQuery::default().offset(), 0);
    }

    #[test]
    fn test_stage_type_serde() {
        let json = serde_json::to_string(&StageType::Won).unwrap();
        assert_eq!(json, "\"won\"");
        let parsed: StageType = serde_json::from_str("\"unspecified\"").unwrap();
        assert_eq!(parsed, StageType::Unspecified);
    }
}
