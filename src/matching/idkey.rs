//! Identity-key resolution for entities.

use std::collections::BTreeMap;

use crate::entity::{Entity, PropertyValue};

/// Which declared key an [`IdentityKey`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKeyKind {
    Primary,
    Additional(usize),
}

/// One identity key of an entity: an ordered set of property names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub kind: IdentityKeyKind,
    pub properties: Vec<String>,
}

impl IdentityKey {
    pub fn is_primary(&self) -> bool {
        self.kind == IdentityKeyKind::Primary
    }

    pub fn is_composite(&self) -> bool {
        self.properties.len() > 1
    }

    pub fn contains(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    /// Comma-joined property names, the form stored on a candidate.
    pub fn label(&self) -> String {
        self.properties.join(",")
    }
}

/// Declared identity keys of `entity`, primary first. Empty key
/// declarations are dropped.
pub fn identity_keys(entity: &Entity) -> Vec<IdentityKey> {
    let primary = std::iter::once((IdentityKeyKind::Primary, &entity.primary_key_properties));
    let additional = entity
        .additional_key_properties
        .iter()
        .enumerate()
        .map(|(idx, props)| (IdentityKeyKind::Additional(idx), props));

    primary
        .chain(additional)
        .filter(|(_, props)| !props.is_empty())
        .map(|(kind, props)| IdentityKey {
            kind,
            properties: props.clone(),
        })
        .collect()
}

/// First identity key (primary before additional) containing `property`.
pub fn key_for_property(entity: &Entity, property: &str) -> Option<IdentityKey> {
    identity_keys(entity).into_iter().find(|key| key.contains(property))
}

pub fn is_key_property(entity: &Entity, property: &str) -> bool {
    entity.primary_key_properties.iter().any(|p| p == property)
        || entity
            .additional_key_properties
            .iter()
            .any(|key| key.iter().any(|p| p == property))
}

/// Values of every fully populated identity key of `entity`.
///
/// A key with any missing or empty part is not a usable projection.
pub fn identity_projections(entity: &Entity) -> Vec<(IdentityKey, BTreeMap<String, PropertyValue>)> {
    identity_keys(entity)
        .into_iter()
        .filter_map(|key| {
            let values: Option<BTreeMap<String, PropertyValue>> = key
                .properties
                .iter()
                .map(|p| entity.non_empty_property(p).map(|v| (p.clone(), v.clone())))
                .collect();
            values.map(|values| (key, values))
        })
        .collect()
}

pub fn has_identity(entity: &Entity) -> bool {
    !identity_projections(entity).is_empty()
}

/// Stable textual identity such as `Node[name=worker-1]`, built from the
/// first populated key. `None` when the entity has no usable key.
pub fn identity_signature(entity: &Entity) -> Option<String> {
    let (_, values) = identity_projections(entity).into_iter().next()?;
    let parts: Vec<String> = values
        .iter()
        .map(|(name, value)| format!("{}={}", name, value.display_string()))
        .collect();
    Some(format!("{}[{}]", entity.entity_type, parts.join(",")))
}
