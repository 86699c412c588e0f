//! When a candidate is worth an oracle call.

use serde::Serialize;

use crate::candidates::RelationCandidate;
use crate::config::EvaluationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientEvidence,
    IncompleteCompositeKey,
    ManuallyDecided,
    AlreadyAccepted,
    AlreadyRejected,
    InsufficientDrift,
    /// Pruned between listing and evaluation.
    Missing,
    /// A concurrent evaluation that started later already stored its verdict.
    Superseded,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InsufficientEvidence => "not enough evidence yet",
            SkipReason::IncompleteCompositeKey => "composite key not fully covered",
            SkipReason::ManuallyDecided => "manually decided",
            SkipReason::AlreadyAccepted => "already accepted",
            SkipReason::AlreadyRejected => "already rejected",
            SkipReason::InsufficientDrift => "insufficient drift to justify re-scoring",
            SkipReason::Missing => "candidate no longer exists",
            SkipReason::Superseded => "a newer evaluation already stored its verdict",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Evaluate,
    Skip(SkipReason),
}

/// Thresholds deciding evaluation and acceptance.
///
/// Both threshold comparisons are closed: a confidence equal to
/// `acceptance_threshold` accepts, one equal to `rejection_threshold` rejects.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPolicy {
    pub min_count_for_eval: u64,
    pub percent_change_for_eval: f64,
    pub acceptance_threshold: f64,
    pub rejection_threshold: f64,
}

impl EvaluationPolicy {
    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            min_count_for_eval: config.min_count_for_eval,
            percent_change_for_eval: config.percent_change_for_eval,
            acceptance_threshold: config.acceptance_threshold,
            rejection_threshold: config.rejection_threshold,
        }
    }

    pub fn is_accepted(&self, confidence: f64) -> bool {
        confidence >= self.acceptance_threshold
    }

    pub fn is_rejected(&self, confidence: f64) -> bool {
        confidence <= self.rejection_threshold
    }

    /// Relative change of `count` since `last_count`. A missing or zero
    /// baseline counts as unbounded drift.
    pub fn drift(count: u64, last_count: u64) -> f64 {
        if last_count == 0 {
            return f64::INFINITY;
        }
        (count as f64 - last_count as f64).abs() / last_count as f64
    }

    pub fn decide(&self, candidate: &RelationCandidate, force: bool) -> Decision {
        let heuristic = &candidate.heuristic;
        if heuristic.count < self.min_count_for_eval {
            return Decision::Skip(SkipReason::InsufficientEvidence);
        }
        if !heuristic.is_composite_complete() {
            return Decision::Skip(SkipReason::IncompleteCompositeKey);
        }
        if force {
            return Decision::Evaluate;
        }
        if candidate.is_manually_decided() {
            return Decision::Skip(SkipReason::ManuallyDecided);
        }

        let Some(evaluation) = &candidate.evaluation else {
            return Decision::Evaluate;
        };
        let confidence = evaluation.confidence();
        if self.is_accepted(confidence) {
            return Decision::Skip(SkipReason::AlreadyAccepted);
        }
        if self.is_rejected(confidence) {
            return Decision::Skip(SkipReason::AlreadyRejected);
        }
        if Self::drift(heuristic.count, evaluation.last_evaluation_count) < self.percent_change_for_eval {
            return Decision::Skip(SkipReason::InsufficientDrift);
        }
        Decision::Evaluate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::{RelationEvaluation, PropertyMapping};
    use crate::matching::MatchType;
    use crate::testing::simple_observation;

    fn policy() -> EvaluationPolicy {
        EvaluationPolicy {
            min_count_for_eval: 3,
            percent_change_for_eval: 0.2,
            acceptance_threshold: 0.75,
            rejection_threshold: 0.3,
        }
    }

    fn candidate(count: u64, evaluation: Option<(Option<f64>, u64)>) -> RelationCandidate {
        let obs = simple_observation("Pod", "node_name", "Node", "name", "a", "b");
        let mut heuristic = obs.empty_heuristic();
        heuristic.count = count;
        let mut mapping = PropertyMapping::new("node_name", "name", MatchType::Exact, 1.0);
        mapping.count = count;
        heuristic.property_mappings.push(mapping);
        RelationCandidate {
            relation_id: obs.relation_id(),
            heuristic,
            evaluation: evaluation.map(|(confidence, last)| RelationEvaluation {
                relation_name: "HAS_NODE".into(),
                relation_confidence: confidence,
                justification: String::new(),
                thought: None,
                last_evaluation_count: last,
            }),
            evaluated_at: None,
            evaluation_error: None,
            manually_accepted: false,
            manually_rejected: false,
            applied: false,
            synced_relation_name: None,
            heuristics_version_id: "v".into(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_not_enough_evidence_even_when_forced() {
        let p = policy();
        assert_eq!(
            p.decide(&candidate(2, None), true),
            Decision::Skip(SkipReason::InsufficientEvidence)
        );
        assert_eq!(p.decide(&candidate(3, None), false), Decision::Evaluate);
    }

    #[test]
    fn test_threshold_boundaries_are_closed() {
        let p = policy();
        assert_eq!(
            p.decide(&candidate(100, Some((Some(0.75), 3))), false),
            Decision::Skip(SkipReason::AlreadyAccepted)
        );
        assert_eq!(
            p.decide(&candidate(100, Some((Some(0.3), 3))), false),
            Decision::Skip(SkipReason::AlreadyRejected)
        );
        assert_eq!(p.decide(&candidate(100, Some((Some(0.5), 3))), false), Decision::Evaluate);
        assert_eq!(p.decide(&candidate(100, Some((Some(0.75), 3))), true), Decision::Evaluate);
    }

    #[test]
    fn test_null_confidence_leans_reject() {
        assert_eq!(
            policy().decide(&candidate(10, Some((None, 5))), false),
            Decision::Skip(SkipReason::AlreadyRejected)
        );
    }

    #[test]
    fn test_drift() {
        let p = policy();
        assert_eq!(
            p.decide(&candidate(11, Some((Some(0.5), 10))), false),
            Decision::Skip(SkipReason::InsufficientDrift)
        );
        assert_eq!(p.decide(&candidate(12, Some((Some(0.5), 10))), false), Decision::Evaluate);
        // Shrinking evidence drifts too.
        assert_eq!(p.decide(&candidate(8, Some((Some(0.5), 10))), false), Decision::Evaluate);
        assert_eq!(
            p.decide(&candidate(9, Some((Some(0.5), 10))), false),
            Decision::Skip(SkipReason::InsufficientDrift)
        );
        assert_eq!(p.decide(&candidate(5, Some((Some(0.5), 0))), false), Decision::Evaluate);
        assert!(EvaluationPolicy::drift(4, 0).is_infinite());
    }

    #[test]
    fn test_manual_decisions_need_force() {
        let p = policy();
        let mut c = candidate(10, None);
        c.manually_rejected = true;
        assert_eq!(p.decide(&c, false), Decision::Skip(SkipReason::ManuallyDecided));
        assert_eq!(p.decide(&c, true), Decision::Evaluate);
    }

    #[test]
    fn test_incomplete_composite_never_evaluated() {
        let mut c = candidate(10, None);
        c.heuristic.is_entity_b_idkey_composite = true;
        c.heuristic.entity_b_idkey_property = "region,account_id".into();
        assert_eq!(
            policy().decide(&c, true),
            Decision::Skip(SkipReason::IncompleteCompositeKey)
        );
    }
}
