use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::PropertyStatsCache;
use crate::candidates::{CandidateManager, RelationCandidate};
use crate::error::Result;
use crate::graph::GraphStore;
use crate::oracle::{EvaluationContext, PropertyCoverage, SiblingSummary};

/// Gathers what the oracle is shown about a candidate: live matching values,
/// sibling candidates between the same types and property coverage.
pub struct ContextBuilder {
    manager: Arc<CandidateManager>,
    graph: Arc<dyn GraphStore>,
    stats: Arc<PropertyStatsCache>,
    sibling_limit: usize,
    example_value_limit: usize,
}

impl ContextBuilder {
    pub fn new(
        manager: Arc<CandidateManager>,
        graph: Arc<dyn GraphStore>,
        stats: Arc<PropertyStatsCache>,
        sibling_limit: usize,
        example_value_limit: usize,
    ) -> Self {
        Self {
            manager,
            graph,
            stats,
            sibling_limit,
            example_value_limit,
        }
    }

    pub async fn build(&self, candidate: &RelationCandidate) -> Result<EvaluationContext> {
        let heuristic = &candidate.heuristic;
        let matching = heuristic.matching_properties();

        // Composite candidates name several A properties; filter on the first.
        let filter_property = matching
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| heuristic.entity_a_property.clone());
        let matching_values = if self.example_value_limit == 0 {
            Vec::new()
        } else {
            self.graph
                .get_values_of_matching_property(
                    &heuristic.entity_a_type,
                    &filter_property,
                    &heuristic.entity_b_type,
                    &matching,
                    self.example_value_limit,
                )
                .await?
        };

        let siblings = self
            .manager
            .fetch_siblings(
                &heuristic.entity_a_type,
                &heuristic.entity_b_type,
                &candidate.relation_id,
                self.sibling_limit,
            )
            .await?
            .into_iter()
            .map(|sibling| SiblingSummary {
                entity_a_property: sibling.heuristic.entity_a_property.clone(),
                entity_b_idkey_property: sibling.heuristic.entity_b_idkey_property.clone(),
                count: sibling.heuristic.count,
                deep_match_quality: sibling.heuristic.deep_match_quality,
                relation_name: sibling.evaluation.as_ref().map(|_| sibling.relation_name()),
                relation_confidence: sibling.evaluation.as_ref().and_then(|e| e.relation_confidence),
            })
            .collect();

        let mut properties = BTreeSet::new();
        for (a_prop, b_prop) in &matching {
            properties.insert((heuristic.entity_a_type.clone(), a_prop.clone()));
            properties.insert((heuristic.entity_b_type.clone(), b_prop.clone()));
        }
        let mut coverage = Vec::with_capacity(properties.len());
        for (entity_type, property) in properties {
            let stats = self.stats.get(&entity_type, &property).await?;
            coverage.push(PropertyCoverage {
                entity_type,
                property,
                stats,
            });
        }

        Ok(EvaluationContext {
            relation_id: candidate.relation_id.clone(),
            entity_a_type: heuristic.entity_a_type.clone(),
            entity_a_property: heuristic.entity_a_property.clone(),
            entity_b_type: heuristic.entity_b_type.clone(),
            entity_b_idkey_property: heuristic.entity_b_idkey_property.clone(),
            is_entity_b_idkey_composite: heuristic.is_entity_b_idkey_composite,
            property_mappings: heuristic.property_mappings.clone(),
            match_count: heuristic.count,
            deep_match_quality: heuristic.deep_match_quality,
            example_matches: heuristic.example_matches.clone(),
            matching_values,
            siblings,
            coverage,
        })
    }
}
