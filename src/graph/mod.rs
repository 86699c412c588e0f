//! Property graph store contract.
//!
//! The engine reads entities and writes relation edges only through
//! [`GraphStore`]. Two stores ship with the crate: [`SqliteGraphStore`]
//! (FTS5 identity-key index) and [`MemoryGraphStore`] (tests and embedding).

mod memory;
mod sqlite;

pub use memory::{MemoryGraphStore, RelateCall, RemoveCall};
pub use sqlite::SqliteGraphStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, PropertyValue};
use crate::error::Result;
use crate::matching::value::is_matching;

/// Equality filter on entity properties. Empty matches every entity.
pub type PropertyFilter = BTreeMap<String, PropertyValue>;

/// Entity A property name to entity B identity-key property name.
pub type MatchingProperties = BTreeMap<String, String>;

/// An entity found by identity-key search, with its relevance in [0, 1].
#[derive(Debug, Clone)]
pub struct KeySearchHit {
    pub entity: Entity,
    pub score: f64,
}

/// Coverage statistics for one property of one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValueCount {
    pub entity_count: u64,
    /// Entities with a non-empty value for the property.
    pub populated_count: u64,
    pub distinct_values: u64,
}

impl PropertyValueCount {
    pub fn coverage(&self) -> f64 {
        if self.entity_count == 0 {
            0.0
        } else {
            self.populated_count as f64 / self.entity_count as f64
        }
    }
}

/// Values of one matching entity pair, keyed by property name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingValuePair {
    pub entity_a_values: BTreeMap<String, PropertyValue>,
    pub entity_b_values: BTreeMap<String, PropertyValue>,
}

/// Selects the edges held by one relation candidate.
///
/// An edge may be held by several candidates that resolve to the same
/// endpoints and label. Removing through a filter only releases the
/// holder's claim; the edge itself goes once nobody holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeFilter {
    pub owner: String,
}

impl EdgeFilter {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self { owner: owner.into() }
    }
}

/// Storage behind the property graph.
///
/// Every operation is idempotent from the caller's point of view: relating
/// an already related pair or removing an absent edge is not an error.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_all_entity_types(&self) -> Result<Vec<String>>;

    async fn find_entity(&self, entity_type: &str, filter: &PropertyFilter) -> Result<Vec<Entity>>;

    /// Entities of types other than `exclude_type` whose identity-key values
    /// share tokens with `value`, best first.
    async fn search_identity_keys(
        &self,
        value: &str,
        exclude_type: &str,
        max_results: usize,
    ) -> Result<Vec<KeySearchHit>>;

    async fn get_property_value_count(&self, entity_type: &str, property: &str) -> Result<PropertyValueCount>;

    async fn get_values_of_matching_property(
        &self,
        entity_a_type: &str,
        entity_a_property: &str,
        entity_b_type: &str,
        matching: &MatchingProperties,
        max_results: usize,
    ) -> Result<Vec<MatchingValuePair>>;

    /// Create `relation_name` edges from every A to every B whose properties
    /// match under `matching`, held by `owner`. Returns the number of edges
    /// `owner` did not already hold.
    async fn relate_entities_by_property(
        &self,
        actor: &str,
        owner: &str,
        entity_a_type: &str,
        entity_b_type: &str,
        relation_name: &str,
        matching: &MatchingProperties,
    ) -> Result<usize>;

    /// Release `filter.owner`'s `relation_name` edges. Returns the number of
    /// edges deleted because no other owner held them.
    async fn remove_relation(&self, relation_name: &str, filter: &EdgeFilter) -> Result<usize>;
}

/// True when every mapped A property matches its B key property.
pub(crate) fn pair_matches(a: &Entity, b: &Entity, matching: &MatchingProperties) -> bool {
    !matching.is_empty()
        && matching.iter().all(|(a_prop, b_prop)| {
            match (a.non_empty_property(a_prop), b.non_empty_property(b_prop)) {
                (Some(a_value), Some(b_value)) => is_matching(a_value, b_value).is_match,
                _ => false,
            }
        })
}

pub(crate) fn matching_values(a: &Entity, b: &Entity, matching: &MatchingProperties) -> MatchingValuePair {
    MatchingValuePair {
        entity_a_values: pick_properties(a, matching.keys()),
        entity_b_values: pick_properties(b, matching.values()),
    }
}

fn pick_properties<'a>(
    entity: &Entity,
    names: impl Iterator<Item = &'a String>,
) -> BTreeMap<String, PropertyValue> {
    names
        .filter_map(|name| entity.property(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

pub(crate) fn filter_matches(entity: &Entity, filter: &PropertyFilter) -> bool {
    filter
        .iter()
        .all(|(name, expected)| entity.property(name) == Some(expected))
}

/// Lowercased alphanumeric tokens, deduplicated in first-seen order.
pub(crate) fn search_tokens(value: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

pub(crate) fn property_value_count<'a>(
    entities: impl Iterator<Item = &'a Entity>,
    property: &str,
) -> PropertyValueCount {
    let mut stats = PropertyValueCount::default();
    let mut distinct = std::collections::BTreeSet::new();
    for entity in entities {
        stats.entity_count += 1;
        if let Some(value) = entity.non_empty_property(property) {
            stats.populated_count += 1;
            distinct.insert(value.display_string().to_lowercase());
        }
    }
    stats.distinct_values = distinct.len() as u64;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_tokens() {
        assert_eq!(search_tokens("Worker-1"), vec!["worker", "1"]);
        assert_eq!(search_tokens("a/b a"), vec!["a", "b"]);
        assert!(search_tokens("--").is_empty());
    }

    #[test]
    fn test_pair_matches_composite() {
        let a = Entity::new("Vpc")
            .with_property("region", "eu-west-1")
            .with_property("owner", "1234");
        let b = Entity::new("Account")
            .with_primary_key(["region", "account_id"])
            .with_property("region", "eu-west-1")
            .with_property("account_id", "1234");

        let mut matching = MatchingProperties::new();
        matching.insert("region".into(), "region".into());
        assert!(pair_matches(&a, &b, &matching));

        matching.insert("owner".into(), "account_id".into());
        assert!(pair_matches(&a, &b, &matching));

        let values = matching_values(&a, &b, &matching);
        assert_eq!(values.entity_a_values.len(), 2);
        assert_eq!(values.entity_b_values["account_id"], PropertyValue::from("1234"));

        matching.insert("missing".into(), "region".into());
        assert!(!pair_matches(&a, &b, &matching));
        assert!(!pair_matches(&a, &b, &MatchingProperties::new()));
    }

    #[test]
    fn test_property_value_count() {
        let entities = vec![
            Entity::new("Pod").with_property("node_name", "w1"),
            Entity::new("Pod").with_property("node_name", "W1"),
            Entity::new("Pod").with_property("node_name", "w2"),
            Entity::new("Pod"),
        ];
        let stats = property_value_count(entities.iter(), "node_name");
        assert_eq!(stats.entity_count, 4);
        assert_eq!(stats.populated_count, 3);
        assert_eq!(stats.distinct_values, 2);
        assert!((stats.coverage() - 0.75).abs() < 1e-9);
    }
}
