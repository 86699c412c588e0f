//! Relation candidates: evidence, evaluation outcome and decision state.
//!
//! Persisted state is owned by [`CandidateManager`]; everything else in the
//! crate reads candidates through it and mutates them only through its
//! operations.

pub mod audit;
mod manager;

pub use manager::{CandidateManager, CleanupSummary, HeuristicsState, SyncOutcome, SyncSummary};

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::graph::MatchingProperties;
use crate::matching::value::MatchType;

/// Token identifying one full heuristics run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeuristicsVersion(String);

impl HeuristicsVersion {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for HeuristicsVersion {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for HeuristicsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic candidate id: sha256 over the A type, A property and B type.
pub fn relation_id_for(entity_a_type: &str, entity_a_property: &str, entity_b_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_a_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(entity_a_property.as_bytes());
    hasher.update([0u8]);
    hasher.update(entity_b_type.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Key of one observed entity pair, from the two identity signatures.
pub fn pair_key_for(entity_a_signature: &str, entity_b_signature: &str) -> String {
    format!(
        "{:x}",
        Sha256::digest(format!("{}→{}", entity_a_signature, entity_b_signature).as_bytes())
    )
}

fn camel_boundary() -> &'static Regex {
    static CAMEL: OnceLock<Regex> = OnceLock::new();
    CAMEL.get_or_init(|| Regex::new(r"([a-z0-9])([A-Z])").expect("Invalid regex pattern"))
}

fn non_word() -> &'static Regex {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    NON_WORD.get_or_init(|| Regex::new(r"[^A-Za-z0-9]+").expect("Invalid regex pattern"))
}

/// Upper snake case edge label: `hasNode` and `has node` both become `HAS_NODE`.
pub fn normalize_relation_name(name: &str) -> String {
    let split = camel_boundary().replace_all(name.trim(), "${1}_${2}");
    non_word()
        .replace_all(&split, "_")
        .trim_matches('_')
        .to_uppercase()
}

/// Label used when no evaluated name is available.
pub fn default_relation_name(entity_b_type: &str) -> String {
    format!("HAS_{}", normalize_relation_name(entity_b_type))
}

/// One A property to B identity-key property correspondence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMapping {
    pub entity_a_property: String,
    pub entity_b_idkey_property: String,
    pub match_type: MatchType,
    pub value_match_quality: f64,
    /// Entity pairs that supported this mapping.
    #[serde(default)]
    pub count: u64,
}

impl PropertyMapping {
    pub fn new(
        entity_a_property: impl Into<String>,
        entity_b_idkey_property: impl Into<String>,
        match_type: MatchType,
        value_match_quality: f64,
    ) -> Self {
        Self {
            entity_a_property: entity_a_property.into(),
            entity_b_idkey_property: entity_b_idkey_property.into(),
            match_type,
            value_match_quality,
            count: 0,
        }
    }

    /// `a_prop→b_prop`, the form stored per observation.
    pub fn key(&self) -> String {
        format!("{}→{}", self.entity_a_property, self.entity_b_idkey_property)
    }
}

/// A sampled matching entity pair, kept for inspection and prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleMatch {
    pub pair_key: String,
    pub entity_a: String,
    pub entity_b: String,
    pub entity_a_value: String,
    pub entity_b_value: String,
}

/// Accumulated value-overlap evidence for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FKeyHeuristic {
    pub entity_a_type: String,
    pub entity_a_property: String,
    pub entity_b_type: String,
    pub entity_b_idkey_property: String,
    pub is_entity_b_idkey_composite: bool,
    pub property_mappings: Vec<PropertyMapping>,
    pub count: u64,
    pub example_matches: Vec<ExampleMatch>,
    /// Best deep-match quality observed, used for ranking only.
    pub deep_match_quality: f64,
}

impl FKeyHeuristic {
    pub fn relation_id(&self) -> String {
        relation_id_for(&self.entity_a_type, &self.entity_a_property, &self.entity_b_type)
    }

    /// Properties of the B identity key this candidate points at.
    pub fn idkey_parts(&self) -> Vec<&str> {
        self.entity_b_idkey_property
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }

    /// A simple key is always complete. A composite key is complete when
    /// every key part has a mapping supported by every observed pair.
    pub fn is_composite_complete(&self) -> bool {
        if !self.is_entity_b_idkey_composite {
            return true;
        }
        self.count > 0
            && self.idkey_parts().iter().all(|part| {
                self.property_mappings
                    .iter()
                    .any(|m| m.entity_b_idkey_property == *part && m.count == self.count)
            })
    }

    /// A property to B property map used for graph store calls.
    pub fn matching_properties(&self) -> MatchingProperties {
        if self.is_entity_b_idkey_composite {
            return self
                .property_mappings
                .iter()
                .map(|m| (m.entity_a_property.clone(), m.entity_b_idkey_property.clone()))
                .collect();
        }
        let mut matching = BTreeMap::new();
        matching.insert(self.entity_a_property.clone(), self.entity_b_idkey_property.clone());
        matching
    }

    /// Fold one observation into the evidence. Counts only grow when the
    /// observed pair is new to this candidate.
    pub fn absorb(&mut self, observation: &HeuristicObservation, is_new_pair: bool, example_limit: usize) {
        if self.deep_match_quality < observation.deep_match_quality {
            self.deep_match_quality = observation.deep_match_quality;
        }
        if !is_new_pair {
            return;
        }

        self.count += 1;
        for incoming in &observation.property_mappings {
            match self.property_mappings.iter_mut().find(|m| {
                m.entity_a_property == incoming.entity_a_property
                    && m.entity_b_idkey_property == incoming.entity_b_idkey_property
            }) {
                Some(existing) => {
                    existing.count += 1;
                    if incoming.value_match_quality > existing.value_match_quality {
                        existing.match_type = incoming.match_type;
                        existing.value_match_quality = incoming.value_match_quality;
                    }
                }
                None => {
                    let mut mapping = incoming.clone();
                    mapping.count = 1;
                    self.property_mappings.push(mapping);
                }
            }
        }

        if !self.is_entity_b_idkey_composite {
            self.promote_dominant_mapping();
        }

        if self.example_matches.len() < example_limit
            && !self.example_matches.iter().any(|e| e.pair_key == observation.example.pair_key)
        {
            self.example_matches.push(observation.example.clone());
        }
    }

    /// Recompute counts and samples from the pairs still observed, given as
    /// (pair key, mapping keys) tuples.
    pub fn retain_observed(&mut self, observed: &[(String, Vec<String>)]) {
        self.count = observed.len() as u64;
        for mapping in &mut self.property_mappings {
            let key = mapping.key();
            mapping.count = observed.iter().filter(|(_, keys)| keys.contains(&key)).count() as u64;
        }
        self.property_mappings.retain(|m| m.count > 0);
        self.example_matches
            .retain(|e| observed.iter().any(|(pair, _)| *pair == e.pair_key));
        if !self.is_entity_b_idkey_composite {
            self.promote_dominant_mapping();
        }
    }

    /// Point a simple candidate at the B property with the most support.
    fn promote_dominant_mapping(&mut self) {
        let current = self
            .property_mappings
            .iter()
            .find(|m| m.entity_b_idkey_property == self.entity_b_idkey_property)
            .map(|m| m.count)
            .unwrap_or(0);
        if let Some(best) = self
            .property_mappings
            .iter()
            .filter(|m| m.entity_a_property == self.entity_a_property)
            .max_by_key(|m| m.count)
        {
            if best.count > current {
                self.entity_b_idkey_property = best.entity_b_idkey_property.clone();
            }
        }
    }

    /// The strongest match type among the mappings, for display.
    pub fn primary_match_type(&self) -> MatchType {
        self.property_mappings
            .iter()
            .find(|m| m.entity_b_idkey_property == self.entity_b_idkey_property)
            .or_else(|| self.property_mappings.first())
            .map(|m| m.match_type)
            .unwrap_or(MatchType::None)
    }
}

/// Evidence from one entity pair, produced by the heuristics processor and
/// folded into a candidate by [`CandidateManager::upsert_heuristic`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicObservation {
    pub entity_a_type: String,
    pub entity_a_property: String,
    pub entity_b_type: String,
    pub entity_b_idkey_property: String,
    pub is_entity_b_idkey_composite: bool,
    pub property_mappings: Vec<PropertyMapping>,
    pub deep_match_quality: f64,
    pub example: ExampleMatch,
}

impl HeuristicObservation {
    pub fn relation_id(&self) -> String {
        relation_id_for(&self.entity_a_type, &self.entity_a_property, &self.entity_b_type)
    }

    pub fn pair_key(&self) -> &str {
        &self.example.pair_key
    }

    pub fn mapping_keys(&self) -> Vec<String> {
        self.property_mappings.iter().map(PropertyMapping::key).collect()
    }

    /// Empty evidence for a candidate seen for the first time.
    pub fn empty_heuristic(&self) -> FKeyHeuristic {
        FKeyHeuristic {
            entity_a_type: self.entity_a_type.clone(),
            entity_a_property: self.entity_a_property.clone(),
            entity_b_type: self.entity_b_type.clone(),
            entity_b_idkey_property: self.entity_b_idkey_property.clone(),
            is_entity_b_idkey_composite: self.is_entity_b_idkey_composite,
            property_mappings: Vec::new(),
            count: 0,
            example_matches: Vec::new(),
            deep_match_quality: 0.0,
        }
    }
}

/// Latest oracle verdict recorded for a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEvaluation {
    pub relation_name: String,
    pub relation_confidence: Option<f64>,
    pub justification: String,
    pub thought: Option<String>,
    /// Heuristic count when this evaluation was made.
    pub last_evaluation_count: u64,
}

impl RelationEvaluation {
    pub fn confidence(&self) -> f64 {
        self.relation_confidence.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub relation_id: String,
    pub heuristic: FKeyHeuristic,
    pub evaluation: Option<RelationEvaluation>,
    pub evaluated_at: Option<String>,
    pub evaluation_error: Option<String>,
    pub manually_accepted: bool,
    pub manually_rejected: bool,
    /// Whether the relation is accepted, manually or by evaluation.
    pub applied: bool,
    /// Edge label currently materialised in the graph store.
    pub synced_relation_name: Option<String>,
    pub heuristics_version_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RelationCandidate {
    pub fn relation_name(&self) -> String {
        self.evaluation
            .as_ref()
            .map(|e| normalize_relation_name(&e.relation_name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_relation_name(&self.heuristic.entity_b_type))
    }

    /// Edge label the graph store should hold, `None` for no edge.
    pub fn desired_relation_name(&self) -> Option<String> {
        (self.applied && !self.manually_rejected).then(|| self.relation_name())
    }

    pub fn needs_sync(&self) -> bool {
        self.desired_relation_name() != self.synced_relation_name
    }

    pub fn is_manually_decided(&self) -> bool {
        self.manually_accepted || self.manually_rejected
    }

    pub fn confidence(&self) -> Option<f64> {
        self.evaluation.as_ref().map(RelationEvaluation::confidence)
    }

    /// Short status word for listings.
    pub fn status(&self, acceptance_threshold: f64, rejection_threshold: f64) -> &'static str {
        if self.manually_rejected {
            "rejected (manual)"
        } else if self.manually_accepted {
            "accepted (manual)"
        } else {
            match self.confidence() {
                None => "new",
                Some(c) if c >= acceptance_threshold => "accepted",
                Some(c) if c <= rejection_threshold => "rejected",
                Some(_) => "undecided",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(pair: &str, mappings: Vec<PropertyMapping>, composite: bool, b_key: &str) -> HeuristicObservation {
        HeuristicObservation {
            entity_a_type: "Vpc".into(),
            entity_a_property: mappings
                .iter()
                .map(|m| m.entity_a_property.clone())
                .collect::<Vec<_>>()
                .join(","),
            entity_b_type: "Account".into(),
            entity_b_idkey_property: b_key.into(),
            is_entity_b_idkey_composite: composite,
            property_mappings: mappings,
            deep_match_quality: 3.0,
            example: ExampleMatch {
                pair_key: pair.into(),
                entity_a: format!("Vpc[{}]", pair),
                entity_b: "Account[x]".into(),
                entity_a_value: "a".into(),
                entity_b_value: "b".into(),
            },
        }
    }

    #[test]
    fn test_relation_id_is_stable() {
        let a = relation_id_for("Pod", "node_name", "Node");
        assert_eq!(a, relation_id_for("Pod", "node_name", "Node"));
        assert_ne!(a, relation_id_for("Pod", "node", "Node"));
        assert_ne!(relation_id_for("Pod", "xa", "b"), relation_id_for("Pod", "x", "ab"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_normalize_relation_name() {
        assert_eq!(normalize_relation_name("hasNode"), "HAS_NODE");
        assert_eq!(normalize_relation_name("has node"), "HAS_NODE");
        assert_eq!(normalize_relation_name(" HAS_NODE "), "HAS_NODE");
        assert_eq!(normalize_relation_name("runs-on"), "RUNS_ON");
        assert_eq!(normalize_relation_name("  "), "");
        assert_eq!(default_relation_name("Node"), "HAS_NODE");
        assert_eq!(default_relation_name("AwsAccount"), "HAS_AWS_ACCOUNT");
    }

    #[test]
    fn test_absorb_counts_new_pairs_once() {
        let obs = observation(
            "p1",
            vec![PropertyMapping::new("node_name", "name", MatchType::Exact, 1.0)],
            false,
            "name",
        );
        let mut heuristic = obs.empty_heuristic();
        heuristic.absorb(&obs, true, 5);
        heuristic.absorb(&obs, false, 5);
        assert_eq!(heuristic.count, 1);
        assert_eq!(heuristic.property_mappings[0].count, 1);
        assert_eq!(heuristic.example_matches.len(), 1);
        assert_eq!(heuristic.deep_match_quality, 3.0);
    }

    #[test]
    fn test_example_matches_keep_first_n() {
        let mapping = PropertyMapping::new("node_name", "name", MatchType::Exact, 1.0);
        let mut heuristic = observation("p0", vec![mapping.clone()], false, "name").empty_heuristic();
        for i in 0..8 {
            let obs = observation(&format!("p{}", i), vec![mapping.clone()], false, "name");
            heuristic.absorb(&obs, true, 3);
        }
        assert_eq!(heuristic.count, 8);
        let pairs: Vec<&str> = heuristic.example_matches.iter().map(|e| e.pair_key.as_str()).collect();
        assert_eq!(pairs, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn test_dominant_mapping_promoted() {
        let by_name = PropertyMapping::new("node", "name", MatchType::Suffix, 0.7);
        let by_uid = PropertyMapping::new("node", "uid", MatchType::Exact, 1.0);
        let mut heuristic = observation("p0", vec![by_name.clone()], false, "name").empty_heuristic();
        heuristic.absorb(&observation("p0", vec![by_name], false, "name"), true, 5);
        heuristic.absorb(&observation("p1", vec![by_uid.clone()], false, "uid"), true, 5);
        assert_eq!(heuristic.entity_b_idkey_property, "name");
        heuristic.absorb(&observation("p2", vec![by_uid], false, "uid"), true, 5);
        assert_eq!(heuristic.entity_b_idkey_property, "uid");
        assert_eq!(heuristic.primary_match_type(), MatchType::Exact);
    }

    #[test]
    fn test_retain_observed() {
        let by_name = PropertyMapping::new("node", "name", MatchType::Exact, 1.0);
        let by_uid = PropertyMapping::new("node", "uid", MatchType::Exact, 1.0);
        let mut heuristic = observation("p0", vec![by_name.clone()], false, "name").empty_heuristic();
        heuristic.absorb(&observation("p0", vec![by_name.clone()], false, "name"), true, 5);
        heuristic.absorb(&observation("p1", vec![by_name.clone()], false, "name"), true, 5);
        heuristic.absorb(&observation("p2", vec![by_uid.clone()], false, "uid"), true, 5);

        heuristic.retain_observed(&[("p2".to_string(), vec![by_uid.key()])]);
        assert_eq!(heuristic.count, 1);
        assert_eq!(heuristic.property_mappings.len(), 1);
        assert_eq!(heuristic.entity_b_idkey_property, "uid");
        assert_eq!(heuristic.example_matches.len(), 1);
        assert_eq!(heuristic.example_matches[0].pair_key, "p2");
    }

    #[test]
    fn test_composite_completeness() {
        let region = PropertyMapping::new("region", "region", MatchType::Exact, 1.0);
        let owner = PropertyMapping::new("owner", "account_id", MatchType::Exact, 1.0);

        let partial = observation("p0", vec![region.clone()], true, "region,account_id");
        let mut heuristic = partial.empty_heuristic();
        heuristic.absorb(&partial, true, 5);
        assert!(!heuristic.is_composite_complete());

        let full = observation("p1", vec![region, owner], true, "region,account_id");
        let mut heuristic = full.empty_heuristic();
        heuristic.absorb(&full, true, 5);
        assert!(heuristic.is_composite_complete());
        assert_eq!(heuristic.matching_properties().len(), 2);

        heuristic.property_mappings[1].count = 0;
        assert!(!heuristic.is_composite_complete());
    }

    #[test]
    fn test_desired_relation_name() {
        let obs = observation(
            "p1",
            vec![PropertyMapping::new("node_name", "name", MatchType::Exact, 1.0)],
            false,
            "name",
        );
        let mut candidate = RelationCandidate {
            relation_id: obs.relation_id(),
            heuristic: obs.empty_heuristic(),
            evaluation: None,
            evaluated_at: None,
            evaluation_error: None,
            manually_accepted: false,
            manually_rejected: false,
            applied: false,
            synced_relation_name: None,
            heuristics_version_id: "v1".into(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(candidate.desired_relation_name(), None);
        assert!(!candidate.needs_sync());

        candidate.applied = true;
        assert_eq!(candidate.desired_relation_name().as_deref(), Some("HAS_ACCOUNT"));
        assert!(candidate.needs_sync());

        candidate.evaluation = Some(RelationEvaluation {
            relation_name: "ownedBy".into(),
            relation_confidence: None,
            justification: String::new(),
            thought: None,
            last_evaluation_count: 1,
        });
        assert_eq!(candidate.desired_relation_name().as_deref(), Some("OWNED_BY"));
        assert_eq!(candidate.confidence(), Some(0.0));

        candidate.manually_rejected = true;
        assert_eq!(candidate.desired_relation_name(), None);
    }

    #[test]
    fn test_status_boundaries() {
        let obs = observation("p", vec![], false, "name");
        let mut candidate = RelationCandidate {
            relation_id: obs.relation_id(),
            heuristic: obs.empty_heuristic(),
            evaluation: Some(RelationEvaluation {
                relation_name: "HAS_ACCOUNT".into(),
                relation_confidence: Some(0.75),
                justification: String::new(),
                thought: None,
                last_evaluation_count: 1,
            }),
            evaluated_at: None,
            evaluation_error: None,
            manually_accepted: false,
            manually_rejected: false,
            applied: false,
            synced_relation_name: None,
            heuristics_version_id: "v1".into(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(candidate.status(0.75, 0.3), "accepted");
        if let Some(e) = candidate.evaluation.as_mut() {
            e.relation_confidence = Some(0.3);
        }
        assert_eq!(candidate.status(0.75, 0.3), "rejected");
    }
}
