//! # Stats Service
//!
//! Feeds the pure funnel math in `funnel_core::stats` from either the lead
//! store or a freshly fetched lead set.
//!
//! ## Two Entry Points
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          StatsService                                   │
//! │                                                                         │
//! │  from_store(tenant, pipelines)          from_leads(tenant, leads, ...)  │
//! │       │                                      │                          │
//! │       ▼                                      ▼                          │
//! │  db.leads().funnel_counts()            tally_leads(leads)               │
//! │       │   (one GROUP BY query)               │   (in memory)            │
//! │       └──────────────┬───────────────────────┘                          │
//! │                      ▼                                                  │
//! │     Classifier::classify_all(pipelines) ──► compute_stats              │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │     FunnelStats (inconsistent positions logged with warn!)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use funnel_core::{compute_stats, tally_leads, Classifier, FunnelStats, Lead, LeadTally, Pipeline};
use funnel_db::Database;

use crate::error::SyncResult;

/// Where a stats answer was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    /// The local lead store.
    Store,
    /// Leads fetched from the CRM for this request.
    Live,
}

/// Stats answer for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantStats {
    #[serde(flatten)]
    pub stats: FunnelStats,

    /// True when the store holds nothing for the tenant yet; the zeros in
    /// `stats` then mean "unknown", not "empty funnel".
    pub needs_sync: bool,

    pub source: StatsSource,

    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Computes funnel stats for tenants.
#[derive(Debug, Clone)]
pub struct StatsService {
    db: Database,
    classifier: Classifier,
}

impl StatsService {
    pub fn new(db: Database, classifier: Classifier) -> Self {
        StatsService { db, classifier }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Stats over everything stored for the tenant.
    pub async fn from_store(
        &self,
        tenant_id: &str,
        pipelines: &[Pipeline],
    ) -> SyncResult<FunnelStats> {
        let tallies = self.db.leads().funnel_counts(tenant_id).await?;
        debug!(tenant_id = %tenant_id, groups = tallies.len(), "Loaded stored lead tallies");
        Ok(self.compute(tenant_id, &tallies, pipelines))
    }

    /// Stats over an already fetched lead set, without touching the store.
    pub fn from_leads(
        &self,
        tenant_id: &str,
        leads: &[Lead],
        pipelines: &[Pipeline],
    ) -> FunnelStats {
        self.compute(tenant_id, &tally_leads(leads), pipelines)
    }

    fn compute(
        &self,
        tenant_id: &str,
        tallies: &[LeadTally],
        pipelines: &[Pipeline],
    ) -> FunnelStats {
        let classification = self.classifier.classify_all(pipelines);
        let stats = compute_stats(tallies, pipelines, &classification);

        for position in &stats.inconsistent {
            warn!(
                tenant_id = %tenant_id,
                pipeline_id = position.pipeline_id,
                status_id = position.status_id,
                count = position.count,
                "Leads sit on a status that is not a stage of their pipeline"
            );
        }

        stats
    }
}
