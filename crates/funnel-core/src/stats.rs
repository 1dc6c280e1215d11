//! # Funnel Statistics
//!
//! Turns lead counts plus a pipeline classification into funnel totals and a
//! per-pipeline, per-stage distribution.
//!
//! ## Inputs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stats Computation                                │
//! │                                                                         │
//! │  Lead store (GROUP BY)  ─┐                                              │
//! │                          ├──► [LeadTally] ──┐                           │
//! │  Fetched leads ──────────┘  (tally_leads)   │                           │
//! │                                             ▼                           │
//! │  Pipelines ──► Classifier ──► Classification ──► compute_stats          │
//! │                                                      │                  │
//! │                                                      ▼                  │
//! │                     FunnelStats { totals, distribution, inconsistent } │
//! │                                                                         │
//! │  total  = every lead, soft-deleted included                            │
//! │  won    = non-deleted leads on a WON stage of their own pipeline       │
//! │  lost   = non-deleted leads on a LOST stage of their own pipeline      │
//! │  active = non-deleted - won - lost                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Working on tallies rather than individual leads lets the store answer with
//! a single grouped query while fetched lead sets go through [`tally_leads`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classifier::{Classification, StageOutcome};
use crate::types::{Lead, Pipeline};

// =============================================================================
// Tallies
// =============================================================================

/// Number of leads sharing a funnel position and delete flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadTally {
    pub pipeline_id: i64,
    pub status_id: i64,
    pub is_deleted: bool,
    pub count: u64,
}

/// Groups leads by (pipeline, status, deleted).
pub fn tally_leads(leads: &[Lead]) -> Vec<LeadTally> {
    let mut groups: BTreeMap<(i64, i64, bool), u64> = BTreeMap::new();
    for lead in leads {
        *groups
            .entry((lead.pipeline_id, lead.status_id, !lead.is_active()))
            .or_insert(0) += 1;
    }

    groups
        .into_iter()
        .map(|((pipeline_id, status_id, is_deleted), count)| LeadTally {
            pipeline_id,
            status_id,
            is_deleted,
            count,
        })
        .collect()
}

// =============================================================================
// Results
// =============================================================================

/// Headline funnel numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelTotals {
    pub total: u64,
    pub won: u64,
    pub lost: u64,
    pub active: u64,
}

/// Non-deleted lead count for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCount {
    pub stage_id: i64,
    pub stage_name: String,
    pub sort_order: i64,
    pub outcome: StageOutcome,
    pub count: u64,
}

/// Per-stage counts for one pipeline, stages in sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDistribution {
    pub pipeline_id: i64,
    pub pipeline_name: String,
    pub total: u64,
    pub stages: Vec<StageCount>,
}

/// Leads whose status is not a stage of their own pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistentPosition {
    pub pipeline_id: i64,
    pub status_id: i64,
    pub count: u64,
}

/// Complete stats answer for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStats {
    pub totals: FunnelTotals,
    pub distribution: Vec<PipelineDistribution>,
    /// Excluded from `distribution`; callers are expected to log these.
    pub inconsistent: Vec<InconsistentPosition>,
}

// =============================================================================
// Computation
// =============================================================================

/// Computes funnel totals and distribution.
///
/// ## Example
/// ```rust
/// use funnel_core::{compute_stats, tally_leads, Classifier, Lead, Pipeline, Stage, StageType};
///
/// let pipeline = Pipeline::new(1, "Sales", vec![
///     Stage::new(10, "Open", 1),
///     Stage::new(11, "Won", 2).with_type(StageType::Won),
///     Stage::new(12, "Lost", 3).with_type(StageType::Lost),
/// ]);
/// let leads = vec![Lead::new(1, 1, 10), Lead::new(2, 1, 11), Lead::new(3, 1, 12)];
///
/// let classification = Classifier::default().classify_all(std::slice::from_ref(&pipeline));
/// let stats = compute_stats(&tally_leads(&leads), &[pipeline], &classification);
/// assert_eq!((stats.totals.won, stats.totals.lost, stats.totals.active), (1, 1, 1));
/// ```
pub fn compute_stats(
    tallies: &[LeadTally],
    pipelines: &[Pipeline],
    classification: &Classification,
) -> FunnelStats {
    let mut totals = FunnelTotals::default();
    let mut non_deleted = 0u64;
    let mut per_stage: BTreeMap<(i64, i64), u64> = BTreeMap::new();
    let mut inconsistent: BTreeMap<(i64, i64), u64> = BTreeMap::new();

    let known: BTreeMap<i64, &Pipeline> = pipelines.iter().map(|p| (p.id, p)).collect();

    for tally in tallies {
        totals.total += tally.count;
        if tally.is_deleted {
            continue;
        }
        non_deleted += tally.count;

        match classification.outcome(tally.pipeline_id, tally.status_id) {
            Some(StageOutcome::Won) => totals.won += tally.count,
            Some(StageOutcome::Lost) => totals.lost += tally.count,
            _ => {}
        }

        let in_pipeline = known
            .get(&tally.pipeline_id)
            .is_some_and(|p| p.has_stage(tally.status_id));

        let bucket = if in_pipeline {
            &mut per_stage
        } else {
            &mut inconsistent
        };
        *bucket
            .entry((tally.pipeline_id, tally.status_id))
            .or_insert(0) += tally.count;
    }

    totals.active = non_deleted.saturating_sub(totals.won + totals.lost);

    let mut ordered: Vec<&Pipeline> = pipelines.iter().collect();
    ordered.sort_by_key(|p| (p.sort_order, p.id));

    let distribution = ordered
        .into_iter()
        .map(|pipeline| {
            let stages: Vec<StageCount> = pipeline
                .ordered_stages()
                .into_iter()
                .map(|stage| StageCount {
                    stage_id: stage.id,
                    stage_name: stage.name.clone(),
                    sort_order: stage.sort_order,
                    outcome: classification
                        .outcome(pipeline.id, stage.id)
                        .unwrap_or(StageOutcome::Open),
                    count: per_stage
                        .get(&(pipeline.id, stage.id))
                        .copied()
                        .unwrap_or(0),
                })
                .collect();

            PipelineDistribution {
                pipeline_id: pipeline.id,
                pipeline_name: pipeline.name.clone(),
                total: stages.iter().map(|s| s.count).sum(),
                stages,
            }
        })
        .collect();

    FunnelStats {
        totals,
        distribution,
        inconsistent: inconsistent
            .into_iter()
            .map(|((pipeline_id, status_id), count)| InconsistentPosition {
                pipeline_id,
                status_id,
                count,
            })
            .collect(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::types::{Stage, StageType};

    fn sales_pipeline() -> Pipeline {
        Pipeline::new(
            1,
            "P",
            vec![
                Stage::new(10, "Open", 1),
                Stage::new(20, "Won", 2).with_type(StageType::Won),
                Stage::new(30, "Lost", 3).with_type(StageType::Lost),
            ],
        )
    }

    fn stats_for(leads: &[Lead], pipelines: &[Pipeline]) -> FunnelStats {
        let classification = Classifier::default().classify_all(pipelines);
        compute_stats(&tally_leads(leads), pipelines, &classification)
    }

    #[test]
    fn test_five_lead_scenario() {
        let leads = vec![
            Lead::new(1, 1, 10),
            Lead::new(2, 1, 10),
            Lead::new(3, 1, 20),
            Lead::new(4, 1, 20),
            Lead::new(5, 1, 30),
        ];
        let stats = stats_for(&leads, &[sales_pipeline()]);

        assert_eq!(
            stats.totals,
            FunnelTotals {
                total: 5,
                won: 2,
                lost: 1,
                active: 2
            }
        );
        let counts: Vec<u64> = stats.distribution[0].stages.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert!(stats.inconsistent.is_empty());
    }

    #[test]
    fn test_deleted_leads_count_only_in_total() {
        let leads = vec![
            Lead::new(1, 1, 20),
            Lead::new(2, 1, 20).deleted(),
            Lead::new(3, 1, 10).deleted(),
        ];
        let stats = stats_for(&leads, &[sales_pipeline()]);

        assert_eq!(stats.totals.total, 3);
        assert_eq!(stats.totals.won, 1);
        assert_eq!(stats.totals.active, 0);
        assert_eq!(stats.distribution[0].total, 1);
    }

    #[test]
    fn test_status_from_other_pipeline_is_inconsistent() {
        let other = Pipeline::new(2, "Other", vec![Stage::new(99, "x", 1)]);
        let leads = vec![
            Lead::new(1, 1, 99),
            Lead::new(2, 1, 10),
            Lead::new(3, 7, 10),
        ];
        let stats = stats_for(&leads, &[sales_pipeline(), other]);

        assert_eq!(stats.totals.total, 3);
        assert_eq!(stats.totals.active, 3);
        assert_eq!(stats.distribution[0].total, 1);
        assert_eq!(stats.distribution[1].total, 0);
        assert_eq!(
            stats.inconsistent,
            vec![
                InconsistentPosition {
                    pipeline_id: 1,
                    status_id: 99,
                    count: 1
                },
                InconsistentPosition {
                    pipeline_id: 7,
                    status_id: 10,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_tally_groups_by_position_and_flag() {
        let mut unflagged = Lead::new(3, 1, 10);
        unflagged.is_deleted = None;
        let leads = vec![
            Lead::new(1, 1, 10),
            Lead::new(2, 1, 10).deleted(),
            unflagged,
        ];
        let tallies = tally_leads(&leads);

        assert_eq!(tallies.len(), 2);
        assert_eq!(tallies[0].count, 2);
        assert!(!tallies[0].is_deleted);
        assert!(tallies[1].is_deleted);
    }

    #[test]
    fn test_empty_input() {
        let stats = stats_for(&[], &[]);
        assert_eq!(stats, FunnelStats::default());
    }
}
