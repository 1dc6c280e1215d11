//! # Stage Classifier
//!
//! Labels every stage of a pipeline as won, lost or open.
//!
//! ## Priority Order (first match wins per stage)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Stage Classification                                │
//! │                                                                         │
//! │  stages sorted by (sort_order, id)                                     │
//! │                                                                         │
//! │   [ s0 ][ s1 ][ s2 ] ... [ sN-2 ][ sN-1 ]                              │
//! │   └──────── middle ───────┘└─ last two ─┘                              │
//! │                                                                         │
//! │  1. stage_type won/lost           → authoritative, any position        │
//! │                                                                         │
//! │  2. last two stages               → won keywords, then lost keywords   │
//! │                                     no match: sN-2 = WON, sN-1 = LOST  │
//! │                                                                         │
//! │  3. middle stages                 → won keywords, then lost keywords   │
//! │                                     no match: OPEN                     │
//! │                                                                         │
//! │  pipelines with fewer than 2 stages: every stage OPEN                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keyword lists live in a [`KeywordRules`] table so deployments can extend
//! them from configuration. The priority order above is fixed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{Pipeline, StageType};

// =============================================================================
// Outcome
// =============================================================================

/// Funnel outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Open,
    Won,
    Lost,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageOutcome::Open => write!(f, "open"),
            StageOutcome::Won => write!(f, "won"),
            StageOutcome::Lost => write!(f, "lost"),
        }
    }
}

// =============================================================================
// Keyword Rules
// =============================================================================

/// A single name-matching rule.
///
/// In TOML a phrase is a bare string and a token rule is an inline table:
/// ```toml
/// won = ["closed won", "ganado", { token = "won", unless = "lost" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeywordRule {
    /// Case-insensitive substring match.
    Phrase(String),

    /// Case-insensitive substring match, vetoed when `unless` also occurs
    /// anywhere in the name.
    Token {
        token: String,
        #[serde(default)]
        unless: Option<String>,
    },
}

impl KeywordRule {
    /// Creates a phrase rule.
    pub fn phrase(text: impl Into<String>) -> Self {
        KeywordRule::Phrase(text.into())
    }

    /// Creates a token rule with a veto word.
    pub fn token_unless(token: impl Into<String>, unless: impl Into<String>) -> Self {
        KeywordRule::Token {
            token: token.into(),
            unless: Some(unless.into()),
        }
    }

    /// `name` must already be lower-cased.
    fn matches(&self, name: &str) -> bool {
        match self {
            KeywordRule::Phrase(phrase) => name.contains(&phrase.to_lowercase()),
            KeywordRule::Token { token, unless } => {
                name.contains(&token.to_lowercase())
                    && unless
                        .as_ref()
                        .map_or(true, |veto| !name.contains(&veto.to_lowercase()))
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        match self {
            KeywordRule::Phrase(phrase) if phrase.trim().is_empty() => {
                Err(CoreError::InvalidKeywordRule {
                    reason: "phrase must not be empty".to_string(),
                })
            }
            KeywordRule::Token { token, .. } if token.trim().is_empty() => {
                Err(CoreError::InvalidKeywordRule {
                    reason: "token must not be empty".to_string(),
                })
            }
            KeywordRule::Token {
                token,
                unless: Some(veto),
            } if token.eq_ignore_ascii_case(veto) => Err(CoreError::InvalidKeywordRule {
                reason: format!("token '{}' cannot veto itself", token),
            }),
            _ => Ok(()),
        }
    }
}

/// Won and lost keyword lists. Won rules are always checked first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRules {
    #[serde(default = "default_won_rules")]
    pub won: Vec<KeywordRule>,

    #[serde(default = "default_lost_rules")]
    pub lost: Vec<KeywordRule>,
}

fn default_won_rules() -> Vec<KeywordRule> {
    vec![
        KeywordRule::phrase("closed won"),
        KeywordRule::phrase("ganado"),
        KeywordRule::phrase("éxito"),
        KeywordRule::phrase("logrado"),
        KeywordRule::token_unless("won", "lost"),
    ]
}

fn default_lost_rules() -> Vec<KeywordRule> {
    vec![
        KeywordRule::phrase("closed lost"),
        KeywordRule::phrase("perdido"),
        KeywordRule::phrase("perdida"),
        KeywordRule::token_unless("lost", "won"),
    ]
}

impl Default for KeywordRules {
    fn default() -> Self {
        KeywordRules {
            won: default_won_rules(),
            lost: default_lost_rules(),
        }
    }
}

impl KeywordRules {
    /// Appends extra rules after the built-in ones.
    pub fn extend(mut self, won: Vec<KeywordRule>, lost: Vec<KeywordRule>) -> Self {
        self.won.extend(won);
        self.lost.extend(lost);
        self
    }

    /// Rejects rules that could never match or always match.
    pub fn validate(&self) -> CoreResult<()> {
        self.won
            .iter()
            .chain(self.lost.iter())
            .try_for_each(KeywordRule::validate)
    }

    /// Keyword-only outcome for a stage name, `None` when nothing matches.
    pub fn match_name(&self, name: &str) -> Option<StageOutcome> {
        let lowered = name.to_lowercase();

        if self.won.iter().any(|r| r.matches(&lowered)) {
            Some(StageOutcome::Won)
        } else if self.lost.iter().any(|r| r.matches(&lowered)) {
            Some(StageOutcome::Lost)
        } else {
            None
        }
    }
}

// =============================================================================
// Classification Results
// =============================================================================

/// Stage outcomes for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineClassification {
    pub pipeline_id: i64,
    pub outcomes: BTreeMap<i64, StageOutcome>,
}

impl PipelineClassification {
    /// Outcome of a stage, `None` when the stage is not part of the pipeline.
    pub fn outcome(&self, status_id: i64) -> Option<StageOutcome> {
        self.outcomes.get(&status_id).copied()
    }

    fn ids_with(&self, wanted: StageOutcome) -> Vec<i64> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == wanted)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stage ids classified won, ascending.
    pub fn won_ids(&self) -> Vec<i64> {
        self.ids_with(StageOutcome::Won)
    }

    /// Stage ids classified lost, ascending.
    pub fn lost_ids(&self) -> Vec<i64> {
        self.ids_with(StageOutcome::Lost)
    }

    /// Stage ids classified open, ascending.
    pub fn open_ids(&self) -> Vec<i64> {
        self.ids_with(StageOutcome::Open)
    }
}

/// Stage outcomes for every pipeline of a tenant, scoped by pipeline id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub pipelines: BTreeMap<i64, PipelineClassification>,
}

impl Classification {
    /// Outcome of (`pipeline_id`, `status_id`), `None` if either is unknown.
    pub fn outcome(&self, pipeline_id: i64, status_id: i64) -> Option<StageOutcome> {
        self.pipelines
            .get(&pipeline_id)
            .and_then(|p| p.outcome(status_id))
    }

    pub fn pipeline(&self, pipeline_id: i64) -> Option<&PipelineClassification> {
        self.pipelines.get(&pipeline_id)
    }
}

// =============================================================================
// Classifier
// =============================================================================

/// Pure stage classifier.
///
/// ## Example
/// ```rust
/// use funnel_core::classifier::{Classifier, StageOutcome};
/// use funnel_core::types::{Pipeline, Stage, StageType};
///
/// let pipeline = Pipeline::new(1, "Sales", vec![
///     Stage::new(10, "Lead in", 1),
///     Stage::new(11, "Closed - lost", 2).with_type(StageType::Won),
///     Stage::new(12, "Archive", 3),
/// ]);
///
/// let result = Classifier::default().classify(&pipeline);
/// // explicit type beats the name
/// assert_eq!(result.outcome(11), Some(StageOutcome::Won));
/// assert_eq!(result.outcome(12), Some(StageOutcome::Lost));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: KeywordRules,
}

impl Classifier {
    pub fn new(rules: KeywordRules) -> Self {
        Classifier { rules }
    }

    pub fn rules(&self) -> &KeywordRules {
        &self.rules
    }

    /// Classifies one pipeline.
    pub fn classify(&self, pipeline: &Pipeline) -> PipelineClassification {
        let stages = pipeline.ordered_stages();
        let count = stages.len();
        let mut outcomes = BTreeMap::new();

        for (index, stage) in stages.iter().enumerate() {
            let outcome = if count < 2 {
                StageOutcome::Open
            } else {
                match stage.stage_type {
                    StageType::Won => StageOutcome::Won,
                    StageType::Lost => StageOutcome::Lost,
                    StageType::Unspecified => {
                        let keyword = self.rules.match_name(&stage.name);
                        if index == count - 1 {
                            keyword.unwrap_or(StageOutcome::Lost)
                        } else if index == count - 2 {
                            keyword.unwrap_or(StageOutcome::Won)
                        } else {
                            keyword.unwrap_or(StageOutcome::Open)
                        }
                    }
                }
            };
            outcomes.insert(stage.id, outcome);
        }

        PipelineClassification {
            pipeline_id: pipeline.id,
            outcomes,
        }
    }

    /// Classifies every pipeline.
    pub fn classify_all(&self, pipelines: &[Pipeline]) -> Classification {
        Classification {
            pipelines: pipelines
                .iter()
                .map(|p| (p.id, self.classify(p)))
                .collect(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Stage;

    fn classify(stages: Vec<Stage>) -> PipelineClassification {
        Classifier::default().classify(&Pipeline::new(1, "P", stages))
    }

    #[test]
    fn test_explicit_type_wins_over_lost_keywords() {
        let result = classify(vec![
            Stage::new(1, "Closed lost (perdido)", 1).with_type(StageType::Won),
            Stage::new(2, "Negotiation", 2),
            Stage::new(3, "Done", 3),
        ]);
        assert_eq!(result.outcome(1), Some(StageOutcome::Won));
    }

    #[test]
    fn test_two_stage_positional_default() {
        let result = classify(vec![Stage::new(1, "Alpha", 1), Stage::new(2, "Beta", 2)]);
        assert_eq!(result.outcome(1), Some(StageOutcome::Won));
        assert_eq!(result.outcome(2), Some(StageOutcome::Lost));
    }

    #[test]
    fn test_keywords_override_position_in_last_two() {
        // Reversed convention: success stage last.
        let result = classify(vec![
            Stage::new(1, "New", 1),
            Stage::new(2, "Perdido", 2),
            Stage::new(3, "Ganado", 3),
        ]);
        assert_eq!(result.outcome(1), Some(StageOutcome::Open));
        assert_eq!(result.outcome(2), Some(StageOutcome::Lost));
        assert_eq!(result.outcome(3), Some(StageOutcome::Won));
    }

    #[test]
    fn test_middle_stage_keyword_without_positional_default() {
        let result = classify(vec![
            Stage::new(1, "Intake", 1),
            Stage::new(2, "Logrado parcial", 2),
            Stage::new(3, "Qualifying", 3),
            Stage::new(4, "Closed Won", 4),
            Stage::new(5, "Closed Lost", 5),
        ]);
        assert_eq!(result.outcome(1), Some(StageOutcome::Open));
        assert_eq!(result.outcome(2), Some(StageOutcome::Won));
        assert_eq!(result.outcome(3), Some(StageOutcome::Open));
        assert_eq!(result.won_ids(), vec![2, 4]);
        assert_eq!(result.lost_ids(), vec![5]);
    }

    #[test]
    fn test_single_and_empty_pipelines_are_open() {
        let result = classify(vec![Stage::new(1, "Closed won", 1).with_type(StageType::Won)]);
        assert_eq!(result.outcome(1), Some(StageOutcome::Open));

        let result = classify(vec![]);
        assert!(result.outcomes.is_empty());
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let stages = vec![
            Stage::new(30, "Won deal", 3),
            Stage::new(10, "New", 1),
            Stage::new(40, "Lost", 4),
            Stage::new(20, "Contacted", 2),
        ];
        let mut reversed = stages.clone();
        reversed.reverse();

        let a = classify(stages);
        let b = classify(reversed);
        assert_eq!(a, b);
        assert_eq!(a.won_ids(), vec![30]);
        assert_eq!(a.lost_ids(), vec![40]);
        assert_eq!(a.open_ids(), vec![10, 20]);
    }

    #[test]
    fn test_won_token_vetoed_by_lost() {
        let rules = KeywordRules::default();
        assert_eq!(rules.match_name("Won"), Some(StageOutcome::Won));
        assert_eq!(rules.match_name("Won / Lost review"), None);
        assert_eq!(rules.match_name("LOST"), Some(StageOutcome::Lost));
        assert_eq!(rules.match_name("Éxito"), Some(StageOutcome::Won));
    }

    #[test]
    fn test_tokens_match_inside_words() {
        let rules = KeywordRules::default();
        assert_eq!(rules.match_name("Wonderland"), Some(StageOutcome::Won));
        assert_eq!(rules.match_name("Lostboys"), Some(StageOutcome::Lost));
        // The veto is a substring check too.
        assert_eq!(rules.match_name("Wonlost"), None);
        assert_eq!(rules.match_name("Desperdiciado"), None);
    }

    #[test]
    fn test_extended_rules() {
        let rules = KeywordRules::default().extend(vec![KeywordRule::phrase("gagné")], vec![]);
        assert!(rules.validate().is_ok());
        assert_eq!(rules.match_name("Affaire gagnée"), Some(StageOutcome::Won));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let rules = KeywordRules::default().extend(vec![KeywordRule::phrase("  ")], vec![]);
        assert!(matches!(
            rules.validate(),
            Err(CoreError::InvalidKeywordRule { .. })
        ));

        let rules =
            KeywordRules::default().extend(vec![], vec![KeywordRule::token_unless("x", "X")]);
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_classification_is_scoped_by_pipeline() {
        let a = Pipeline::new(1, "A", vec![Stage::new(5, "x", 1), Stage::new(6, "y", 2)]);
        let b = Pipeline::new(
            2,
            "B",
            vec![Stage::new(6, "y", 1), Stage::new(7, "z", 2), Stage::new(8, "w", 3)],
        );
        let all = Classifier::default().classify_all(&[a, b]);

        assert_eq!(all.outcome(1, 6), Some(StageOutcome::Lost));
        assert_eq!(all.outcome(2, 6), Some(StageOutcome::Open));
        assert_eq!(all.outcome(3, 6), None);
    }

    #[test]
    fn test_rules_toml_shape() {
        #[derive(Deserialize)]
        struct Wrapper {
            rules: KeywordRules,
        }
        let parsed: Wrapper = serde_json::from_value(serde_json::json!({
            "rules": {
                "won": ["ok", { "token": "won", "unless": "lost" }],
            }
        }))
        .unwrap();

        assert_eq!(parsed.rules.won.len(), 2);
        assert_eq!(parsed.rules.lost, default_lost_rules());
    }
}
