//! Offline oracle scoring candidates from their own evidence.

use async_trait::async_trait;

use super::{ConfidenceOracle, EvaluationContext, OracleVerdict};
use crate::candidates::default_relation_name;
use crate::error::Result;

/// Scores a candidate from value-match quality, pair support, A-side coverage
/// and whether a sibling outranks it. Never calls out of process.
#[derive(Debug, Clone)]
pub struct HeuristicOracle {
    /// Pair count at which support reaches one half.
    support_half_point: f64,
    /// Multiplier applied when a sibling candidate ranks higher.
    outranked_penalty: f64,
}

impl Default for HeuristicOracle {
    fn default() -> Self {
        Self {
            support_half_point: 2.0,
            outranked_penalty: 0.8,
        }
    }
}

impl HeuristicOracle {
    fn value_quality(context: &EvaluationContext) -> f64 {
        let total: u64 = context.property_mappings.iter().map(|m| m.count.max(1)).sum();
        if total == 0 {
            return 0.0;
        }
        context
            .property_mappings
            .iter()
            .map(|m| m.value_match_quality * m.count.max(1) as f64)
            .sum::<f64>()
            / total as f64
    }

    fn support(&self, count: u64) -> f64 {
        let count = count as f64;
        count / (count + self.support_half_point)
    }

    pub fn score(&self, context: &EvaluationContext) -> f64 {
        let quality = Self::value_quality(context);
        let support = self.support(context.match_count);
        let coverage = context.source_coverage().unwrap_or(1.0);
        let outranked = context
            .siblings
            .iter()
            .any(|s| s.deep_match_quality > context.deep_match_quality);
        let penalty = if outranked { self.outranked_penalty } else { 1.0 };

        let score = quality * (0.5 + 0.5 * support) * (0.5 + 0.5 * coverage) * penalty;
        (score.clamp(0.0, 1.0) * 100.0).round() / 100.0
    }
}

#[async_trait]
impl ConfidenceOracle for HeuristicOracle {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn evaluate(&self, context: &EvaluationContext) -> Result<OracleVerdict> {
        let confidence = self.score(context);
        Ok(OracleVerdict {
            relation_name: default_relation_name(&context.entity_b_type),
            relation_confidence: Some(confidence),
            justification: format!(
                "{} {} value(s) match {} identity key {} across {} entity pair(s)",
                context.entity_a_type,
                context.entity_a_property,
                context.entity_b_type,
                context.entity_b_idkey_property,
                context.match_count
            ),
            thought: Some(format!(
                "value quality {:.2}, coverage {}, {} sibling(s)",
                Self::value_quality(context),
                context
                    .source_coverage()
                    .map(|c| format!("{:.2}", c))
                    .unwrap_or_else(|| "unknown".to_string()),
                context.siblings.len()
            )),
        })
    }
}
