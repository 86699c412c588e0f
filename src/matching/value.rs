//! Property value matching.
//!
//! `is_matching` asks whether a candidate value (a property on entity A)
//! refers to a reference value (an identity-key value on entity B). The
//! comparison is asymmetric: the candidate may extend the reference, never
//! the other way round.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::PropertyValue;

pub const EXACT_QUALITY: f64 = 1.0;
pub const PREFIX_QUALITY: f64 = 0.8;
pub const SUFFIX_QUALITY: f64 = 0.7;
pub const SUBSET_QUALITY: f64 = 0.9;
pub const SUPERSET_QUALITY: f64 = 0.9;
pub const CONTAINS_QUALITY: f64 = 0.85;

/// How two values matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Exact,
    Prefix,
    Suffix,
    Subset,
    Superset,
    Contains,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "EXACT",
            MatchType::Prefix => "PREFIX",
            MatchType::Suffix => "SUFFIX",
            MatchType::Subset => "SUBSET",
            MatchType::Superset => "SUPERSET",
            MatchType::Contains => "CONTAINS",
            MatchType::None => "NONE",
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single value comparison. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub is_match: bool,
    pub match_type: MatchType,
    pub quality: f64,
}

impl MatchResult {
    pub const NO_MATCH: MatchResult = MatchResult {
        is_match: false,
        match_type: MatchType::None,
        quality: 0.0,
    };

    fn matched(match_type: MatchType, quality: f64) -> Self {
        Self {
            is_match: true,
            match_type,
            quality,
        }
    }
}

/// Compare `candidate_value` against `reference_value`.
pub fn is_matching(candidate_value: &PropertyValue, reference_value: &PropertyValue) -> MatchResult {
    if candidate_value.is_empty() || reference_value.is_empty() {
        return MatchResult::NO_MATCH;
    }

    match (candidate_value, reference_value) {
        (PropertyValue::Map(_), _) | (_, PropertyValue::Map(_)) => MatchResult::NO_MATCH,
        (PropertyValue::List(candidate), PropertyValue::List(reference)) => {
            match_sets(&folded_set(candidate), &folded_set(reference))
        }
        (PropertyValue::List(items), scalar) | (scalar, PropertyValue::List(items)) => {
            match fold(scalar) {
                Some(needle) if folded_set(items).contains(&needle) => {
                    MatchResult::matched(MatchType::Contains, CONTAINS_QUALITY)
                }
                _ => MatchResult::NO_MATCH,
            }
        }
        (candidate, reference) => match (fold(candidate), fold(reference)) {
            (Some(c), Some(r)) => match_scalars(&c, &r),
            _ => MatchResult::NO_MATCH,
        },
    }
}

/// Case-folded scalar text, `None` for non-scalars and blanks.
fn fold(value: &PropertyValue) -> Option<String> {
    value
        .scalar_string()
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
}

fn folded_set(items: &[PropertyValue]) -> BTreeSet<String> {
    items.iter().filter_map(fold).collect()
}

fn match_scalars(candidate: &str, reference: &str) -> MatchResult {
    if candidate == reference {
        return MatchResult::matched(MatchType::Exact, EXACT_QUALITY);
    }
    if candidate.len() <= reference.len() {
        return MatchResult::NO_MATCH;
    }
    if candidate.starts_with(reference) {
        MatchResult::matched(MatchType::Prefix, PREFIX_QUALITY)
    } else if candidate.ends_with(reference) {
        MatchResult::matched(MatchType::Suffix, SUFFIX_QUALITY)
    } else {
        MatchResult::NO_MATCH
    }
}

fn match_sets(candidate: &BTreeSet<String>, reference: &BTreeSet<String>) -> MatchResult {
    if candidate.is_empty() || reference.is_empty() {
        MatchResult::NO_MATCH
    } else if candidate == reference {
        MatchResult::matched(MatchType::Exact, EXACT_QUALITY)
    } else if candidate.is_subset(reference) {
        MatchResult::matched(MatchType::Subset, SUBSET_QUALITY)
    } else if candidate.is_superset(reference) {
        MatchResult::matched(MatchType::Superset, SUPERSET_QUALITY)
    } else {
        MatchResult::NO_MATCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn text(s: &str) -> PropertyValue {
        PropertyValue::from(s)
    }

    fn list(items: &[&str]) -> PropertyValue {
        PropertyValue::from(items.to_vec())
    }

    #[test]
    fn test_exact_is_case_insensitive() {
        let result = is_matching(&text("Worker-1"), &text("worker-1"));
        assert!(result.is_match);
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.quality, 1.0);
    }

    #[test]
    fn test_prefix_is_asymmetric() {
        let forward = is_matching(&text("hello-world"), &text("hello"));
        assert!(forward.is_match);
        assert_eq!(forward.match_type, MatchType::Prefix);
        assert_eq!(forward.quality, 0.8);

        let reverse = is_matching(&text("hello"), &text("hello-world"));
        assert!(!reverse.is_match);
        assert_eq!(reverse.match_type, MatchType::None);
        assert_eq!(reverse.quality, 0.0);
    }

    #[test]
    fn test_suffix() {
        let result = is_matching(&text("cluster/worker-1"), &text("WORKER-1"));
        assert_eq!(result.match_type, MatchType::Suffix);
        assert_eq!(result.quality, 0.7);
        assert!(!is_matching(&text("worker-1"), &text("cluster/worker-1")).is_match);
    }

    #[test]
    fn test_numbers_compare_as_text() {
        let result = is_matching(&PropertyValue::Integer(1234), &text("1234"));
        assert_eq!(result.match_type, MatchType::Exact);
    }

    #[test]
    fn test_empty_and_null_never_match() {
        assert!(!is_matching(&text(""), &text("")).is_match);
        assert!(!is_matching(&PropertyValue::Null, &text("a")).is_match);
        assert!(!is_matching(&text("a"), &PropertyValue::Null).is_match);
        assert!(!is_matching(&list(&[]), &list(&["a"])).is_match);
    }

    #[test]
    fn test_list_relations() {
        let exact = is_matching(&list(&["b", "A"]), &list(&["a", "B"]));
        assert_eq!(exact.match_type, MatchType::Exact);
        assert_eq!(exact.quality, 1.0);

        let subset = is_matching(&list(&["a"]), &list(&["a", "b"]));
        assert_eq!(subset.match_type, MatchType::Subset);
        assert_eq!(subset.quality, 0.9);

        let superset = is_matching(&list(&["a", "b", "c"]), &list(&["a", "b"]));
        assert_eq!(superset.match_type, MatchType::Superset);
        assert_eq!(superset.quality, 0.9);

        assert!(!is_matching(&list(&["a", "x"]), &list(&["a", "b"])).is_match);
    }

    #[test]
    fn test_mixed_scalar_and_list() {
        let scalar_in_list = is_matching(&text("Node-2"), &list(&["node-1", "node-2"]));
        assert_eq!(scalar_in_list.match_type, MatchType::Contains);
        assert_eq!(scalar_in_list.quality, 0.85);

        let list_holds_scalar = is_matching(&list(&["node-1", "node-2"]), &text("node-1"));
        assert_eq!(list_holds_scalar.match_type, MatchType::Contains);

        assert!(!is_matching(&text("node-3"), &list(&["node-1"])).is_match);
    }

    #[test]
    fn test_nested_maps_do_not_match() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), text("a"));
        assert!(!is_matching(&PropertyValue::Map(map.clone()), &text("a")).is_match);
        assert!(!is_matching(&text("a"), &PropertyValue::Map(map)).is_match);
    }

    #[test]
    fn test_deterministic() {
        let pairs = [
            (text("hello-world"), text("hello")),
            (list(&["a", "b"]), text("b")),
            (text("x"), text("y")),
        ];
        for (a, b) in &pairs {
            assert_eq!(is_matching(a, b), is_matching(a, b));
        }
    }
}
