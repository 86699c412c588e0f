use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::candidates::{pair_key_for, CandidateManager, ExampleMatch, HeuristicObservation, HeuristicsVersion, PropertyMapping};
use crate::entity::{Entity, PropertyValue};
use crate::error::Result;
use crate::graph::GraphStore;
use crate::matching::idkey::{identity_projections, identity_signature, is_key_property, IdentityKey};
use crate::matching::{deep_match_quality, is_matching, MatchResult};

/// What processing one entity produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    /// The entity has no usable identity key.
    Skipped,
    /// Number of observations recorded.
    Observed(usize),
}

/// Best A property for one key part of a target entity.
#[derive(Debug, Clone)]
struct PartMatch {
    a_property: String,
    b_property: String,
    result: MatchResult,
    /// A properties that matched this part at all.
    num_valid: usize,
}

/// A target entity found by identity-key search.
struct Target {
    entity: Entity,
    signature: String,
    score: f64,
}

pub struct HeuristicsProcessor {
    graph: Arc<dyn GraphStore>,
    manager: Arc<CandidateManager>,
    max_search_results: usize,
}

impl HeuristicsProcessor {
    pub fn new(graph: Arc<dyn GraphStore>, manager: Arc<CandidateManager>, max_search_results: usize) -> Self {
        Self {
            graph,
            manager,
            max_search_results,
        }
    }

    /// Search for entities whose identity keys overlap `entity`'s non-key
    /// properties and record the evidence under `version`.
    pub async fn process(&self, version: &HeuristicsVersion, entity: &Entity) -> Result<EntityOutcome> {
        let Some(signature) = identity_signature(entity) else {
            warn!(
                "Skipping {} entity without a populated identity key",
                entity.entity_type
            );
            return Ok(EntityOutcome::Skipped);
        };

        let sources = source_properties(entity);
        if sources.is_empty() {
            return Ok(EntityOutcome::Observed(0));
        }

        let targets = self.find_targets(entity, &sources).await?;
        let mut recorded = 0;
        for target in targets.values() {
            for observation in observe_pair(entity, &signature, &sources, target) {
                self.manager.upsert_heuristic(version, &observation).await?;
                recorded += 1;
            }
        }

        if recorded > 0 {
            debug!("{}: {} observation(s) across {} target(s)", signature, recorded, targets.len());
        }
        Ok(EntityOutcome::Observed(recorded))
    }

    /// Entities of other types reachable from any search term, keyed by
    /// signature, each with the best search score seen.
    async fn find_targets(
        &self,
        entity: &Entity,
        sources: &BTreeMap<&str, &PropertyValue>,
    ) -> Result<BTreeMap<String, Target>> {
        let mut terms: Vec<String> = sources.values().flat_map(|v| v.search_terms()).collect();
        terms.sort();
        terms.dedup();

        let mut targets: BTreeMap<String, Target> = BTreeMap::new();
        for term in terms {
            let hits = self
                .graph
                .search_identity_keys(&term, &entity.entity_type, self.max_search_results)
                .await?;
            for hit in hits {
                let Some(signature) = identity_signature(&hit.entity) else {
                    continue;
                };
                match targets.get_mut(&signature) {
                    Some(existing) => existing.score = existing.score.max(hit.score),
                    None => {
                        targets.insert(
                            signature.clone(),
                            Target {
                                entity: hit.entity,
                                signature,
                                score: hit.score,
                            },
                        );
                    }
                }
            }
        }
        Ok(targets)
    }
}

/// Non-key properties with a value the matcher can compare.
fn source_properties(entity: &Entity) -> BTreeMap<&str, &PropertyValue> {
    entity
        .all_properties
        .iter()
        .filter(|(name, value)| {
            !is_key_property(entity, name) && !value.is_empty() && !matches!(value, PropertyValue::Map(_))
        })
        .map(|(name, value)| (name.as_str(), value))
        .collect()
}

/// Best matching A property for one B key part. Ties keep the first
/// property in name order.
fn best_for_part(
    sources: &BTreeMap<&str, &PropertyValue>,
    b_property: &str,
    b_value: &PropertyValue,
) -> Option<PartMatch> {
    let mut best: Option<PartMatch> = None;
    let mut num_valid = 0;
    for (a_property, a_value) in sources {
        let result = is_matching(a_value, b_value);
        if !result.is_match {
            continue;
        }
        num_valid += 1;
        if best.as_ref().map_or(true, |b| result.quality > b.result.quality) {
            best = Some(PartMatch {
                a_property: a_property.to_string(),
                b_property: b_property.to_string(),
                result,
                num_valid: 0,
            });
        }
    }
    best.map(|mut b| {
        b.num_valid = num_valid;
        b
    })
}

/// Observations for one (A, B) entity pair: one per A property matching a
/// simple key, one per composite key with at least one part matched.
fn observe_pair(
    entity: &Entity,
    signature: &str,
    sources: &BTreeMap<&str, &PropertyValue>,
    target: &Target,
) -> Vec<HeuristicObservation> {
    let mut simple: BTreeMap<String, PartMatch> = BTreeMap::new();
    let mut observations = Vec::new();

    for (key, values) in identity_projections(&target.entity) {
        if key.is_composite() {
            let parts: Vec<PartMatch> = key
                .properties
                .iter()
                .filter_map(|p| values.get(p).and_then(|v| best_for_part(sources, p, v)))
                .collect();
            if !parts.is_empty() {
                observations.push(composite_observation(entity, signature, sources, target, &key, &values, parts));
            }
            continue;
        }

        let Some(b_property) = key.properties.first() else {
            continue;
        };
        let Some(b_value) = values.get(b_property) else {
            continue;
        };
        let matches: Vec<(String, MatchResult)> = sources
            .iter()
            .filter_map(|(a_property, a_value)| {
                let result = is_matching(a_value, b_value);
                result.is_match.then(|| (a_property.to_string(), result))
            })
            .collect();
        let num_valid = matches.len();
        for (a_property, result) in matches {
            // Keys come primary first, so an equal-quality later key never wins.
            let replace = simple
                .get(&a_property)
                .map_or(true, |current| result.quality > current.result.quality);
            if replace {
                simple.insert(
                    a_property.clone(),
                    PartMatch {
                        a_property,
                        b_property: b_property.clone(),
                        result,
                        num_valid,
                    },
                );
            }
        }
    }

    for part in simple.into_values() {
        let a_value = sources
            .get(part.a_property.as_str())
            .map(|v| v.display_string())
            .unwrap_or_default();
        let b_value = target
            .entity
            .property(&part.b_property)
            .map(PropertyValue::display_string)
            .unwrap_or_default();
        observations.push(HeuristicObservation {
            entity_a_type: entity.entity_type.clone(),
            entity_a_property: part.a_property.clone(),
            entity_b_type: target.entity.entity_type.clone(),
            entity_b_idkey_property: part.b_property.clone(),
            is_entity_b_idkey_composite: false,
            property_mappings: vec![PropertyMapping::new(
                &part.a_property,
                &part.b_property,
                part.result.match_type,
                part.result.quality,
            )],
            deep_match_quality: deep_match_quality(target.score, part.result.quality, part.num_valid),
            example: ExampleMatch {
                pair_key: pair_key_for(signature, &target.signature),
                entity_a: signature.to_string(),
                entity_b: target.signature.clone(),
                entity_a_value: a_value,
                entity_b_value: b_value,
            },
        });
    }

    observations
}

fn composite_observation(
    entity: &Entity,
    signature: &str,
    sources: &BTreeMap<&str, &PropertyValue>,
    target: &Target,
    key: &IdentityKey,
    values: &BTreeMap<String, PropertyValue>,
    parts: Vec<PartMatch>,
) -> HeuristicObservation {
    let num_valid = parts.iter().map(|p| p.num_valid).max().unwrap_or(1);
    let value_quality = parts.iter().map(|p| p.result.quality).sum::<f64>() / parts.len() as f64;

    let render = |pairs: Vec<(&str, String)>| {
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let entity_a_value = render(
        parts
            .iter()
            .map(|p| {
                let value = sources
                    .get(p.a_property.as_str())
                    .map(|v| v.display_string())
                    .unwrap_or_default();
                (p.a_property.as_str(), value)
            })
            .collect(),
    );
    let entity_b_value = render(
        parts
            .iter()
            .map(|p| {
                let value = values.get(&p.b_property).map(PropertyValue::display_string).unwrap_or_default();
                (p.b_property.as_str(), value)
            })
            .collect(),
    );

    HeuristicObservation {
        entity_a_type: entity.entity_type.clone(),
        entity_a_property: parts
            .iter()
            .map(|p| p.a_property.as_str())
            .collect::<Vec<_>>()
            .join(","),
        entity_b_type: target.entity.entity_type.clone(),
        entity_b_idkey_property: key.label(),
        is_entity_b_idkey_composite: true,
        property_mappings: parts
            .iter()
            .map(|p| PropertyMapping::new(&p.a_property, &p.b_property, p.result.match_type, p.result.quality))
            .collect(),
        deep_match_quality: deep_match_quality(target.score, value_quality, num_valid),
        example: ExampleMatch {
            pair_key: pair_key_for(signature, &target.signature),
            entity_a: signature.to_string(),
            entity_b: target.signature.clone(),
            entity_a_value,
            entity_b_value,
        },
    }
}
