//! In-process graph store with token-overlap identity search.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    filter_matches, matching_values, pair_matches, property_value_count, search_tokens, EdgeFilter,
    GraphStore, KeySearchHit, MatchingProperties, MatchingValuePair, PropertyFilter, PropertyValueCount,
};
use crate::entity::Entity;
use crate::error::{Result, ReldiscoError};
use crate::matching::idkey::{identity_projections, identity_signature};

/// A recorded `relate_entities_by_property` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelateCall {
    pub actor: String,
    pub owner: String,
    pub entity_a_type: String,
    pub entity_b_type: String,
    pub relation_name: String,
    pub matching: MatchingProperties,
}

/// A recorded `remove_relation` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCall {
    pub relation_name: String,
    pub filter: EdgeFilter,
}

#[derive(Default)]
struct MemoryState {
    entities: Vec<Entity>,
    /// (source signature, relation name, target signature) to the candidates holding it
    edges: BTreeMap<(String, String, String), BTreeSet<String>>,
    relate_calls: Vec<RelateCall>,
    remove_calls: Vec<RemoveCall>,
}

#[derive(Default)]
pub struct MemoryGraphStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entities: entities.into_iter().collect(),
                ..MemoryState::default()
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn insert_entity(&self, entity: Entity) -> Result<()> {
        self.lock()?.entities.push(entity);
        Ok(())
    }

    /// Remove every entity of `entity_type` whose properties match `filter`.
    pub fn remove_entities(&self, entity_type: &str, filter: &PropertyFilter) -> Result<usize> {
        let mut state = self.lock()?;
        let before = state.entities.len();
        state
            .entities
            .retain(|e| !(e.entity_type == entity_type && filter_matches(e, filter)));
        Ok(before - state.entities.len())
    }

    /// Make relate/remove calls fail until reset, simulating an unreachable store.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn relate_calls(&self) -> Result<Vec<RelateCall>> {
        Ok(self.lock()?.relate_calls.clone())
    }

    pub fn remove_calls(&self) -> Result<Vec<RemoveCall>> {
        Ok(self.lock()?.remove_calls.clone())
    }

    /// Number of materialised edges labelled `relation_name`.
    pub fn edge_count(&self, relation_name: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .edges
            .keys()
            .filter(|(_, name, _)| name == relation_name)
            .count())
    }

    /// Owners currently holding any `relation_name` edge.
    pub fn edge_owners(&self, relation_name: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .lock()?
            .edges
            .iter()
            .filter(|((_, name, _), _)| name == relation_name)
            .flat_map(|(_, owners)| owners.iter().cloned())
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ReldiscoError::GraphStore("memory graph store lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ReldiscoError::GraphStore("graph store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_all_entity_types(&self) -> Result<Vec<String>> {
        let types: BTreeSet<String> = self
            .lock()?
            .entities
            .iter()
            .map(|e| e.entity_type.clone())
            .collect();
        Ok(types.into_iter().collect())
    }

    async fn find_entity(&self, entity_type: &str, filter: &PropertyFilter) -> Result<Vec<Entity>> {
        Ok(self
            .lock()?
            .entities
            .iter()
            .filter(|e| e.entity_type == entity_type && filter_matches(e, filter))
            .cloned()
            .collect())
    }

    async fn search_identity_keys(
        &self,
        value: &str,
        exclude_type: &str,
        max_results: usize,
    ) -> Result<Vec<KeySearchHit>> {
        let query = search_tokens(value);
        if query.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        let state = self.lock()?;
        let mut hits: Vec<KeySearchHit> = state
            .entities
            .iter()
            .filter(|e| e.entity_type != exclude_type)
            .filter_map(|entity| {
                let key_tokens: BTreeSet<String> = identity_projections(entity)
                    .into_iter()
                    .flat_map(|(_, values)| values.into_values())
                    .flat_map(|v| v.search_terms())
                    .flat_map(|term| search_tokens(&term))
                    .collect();
                let overlap = query.iter().filter(|t| key_tokens.contains(*t)).count();
                (overlap > 0).then(|| KeySearchHit {
                    entity: entity.clone(),
                    score: overlap as f64 / query.len().max(key_tokens.len()) as f64,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(max_results);
        Ok(hits)
    }

    async fn get_property_value_count(&self, entity_type: &str, property: &str) -> Result<PropertyValueCount> {
        let state = self.lock()?;
        Ok(property_value_count(
            state.entities.iter().filter(|e| e.entity_type == entity_type),
            property,
        ))
    }

    async fn get_values_of_matching_property(
        &self,
        entity_a_type: &str,
        entity_a_property: &str,
        entity_b_type: &str,
        matching: &MatchingProperties,
        max_results: usize,
    ) -> Result<Vec<MatchingValuePair>> {
        let state = self.lock()?;
        let mut pairs = Vec::new();
        for a in state
            .entities
            .iter()
            .filter(|e| e.entity_type == entity_a_type && e.non_empty_property(entity_a_property).is_some())
        {
            for b in state.entities.iter().filter(|e| e.entity_type == entity_b_type) {
                if pairs.len() >= max_results {
                    return Ok(pairs);
                }
                if pair_matches(a, b, matching) {
                    pairs.push(matching_values(a, b, matching));
                }
            }
        }
        Ok(pairs)
    }

    async fn relate_entities_by_property(
        &self,
        actor: &str,
        owner: &str,
        entity_a_type: &str,
        entity_b_type: &str,
        relation_name: &str,
        matching: &MatchingProperties,
    ) -> Result<usize> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.relate_calls.push(RelateCall {
            actor: actor.to_string(),
            owner: owner.to_string(),
            entity_a_type: entity_a_type.to_string(),
            entity_b_type: entity_b_type.to_string(),
            relation_name: relation_name.to_string(),
            matching: matching.clone(),
        });

        let mut new_edges = Vec::new();
        for a in state.entities.iter().filter(|e| e.entity_type == entity_a_type) {
            for b in state.entities.iter().filter(|e| e.entity_type == entity_b_type) {
                if !pair_matches(a, b, matching) {
                    continue;
                }
                if let (Some(source), Some(target)) = (identity_signature(a), identity_signature(b)) {
                    new_edges.push((source, relation_name.to_string(), target));
                }
            }
        }

        let mut created = 0;
        for edge in new_edges {
            if state.edges.entry(edge).or_default().insert(owner.to_string()) {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn remove_relation(&self, relation_name: &str, filter: &EdgeFilter) -> Result<usize> {
        self.check_writable()?;
        let mut state = self.lock()?;
        state.remove_calls.push(RemoveCall {
            relation_name: relation_name.to_string(),
            filter: filter.clone(),
        });
        let before = state.edges.len();
        state.edges.retain(|(_, name, _), owners| {
            if name == relation_name {
                owners.remove(&filter.owner);
            }
            !owners.is_empty()
        });
        Ok(before - state.edges.len())
    }
}
