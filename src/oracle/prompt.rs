//! Prompt construction for chat-completion oracles.

use std::fmt::Write;

use super::EvaluationContext;
use crate::entity::PropertyValue;

/// Builds system and user messages describing one relation candidate.
pub struct RelationPromptBuilder {
    /// Characters kept per rendered property value.
    max_value_length: usize,
    max_examples: usize,
}

impl Default for RelationPromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationPromptBuilder {
    pub fn new() -> Self {
        Self {
            max_value_length: 120,
            max_examples: 10,
        }
    }

    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = max_examples;
        self
    }

    pub fn system_prompt(&self) -> &'static str {
        r#"You review candidate foreign-key relations in a property graph.
A candidate says that a property of entity type A refers to the identity key of entity type B.
Judge whether the relation is semantically meaningful, not just a coincidental value overlap.

Answer with a single JSON object with these fields:
- relation_name: an edge label in UPPER_SNAKE_CASE describing A -> B (for example RUNS_ON, OWNED_BY)
- relation_confidence: number from 0.0 to 1.0
- justification: one or two sentences
- thought: short notes on the evidence you weighed"#
    }

    pub fn user_prompt(&self, context: &EvaluationContext) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Candidate: {}.{} -> {}.{}{}",
            context.entity_a_type,
            context.entity_a_property,
            context.entity_b_type,
            context.entity_b_idkey_property,
            if context.is_entity_b_idkey_composite {
                " (composite identity key)"
            } else {
                ""
            }
        );
        let _ = writeln!(
            out,
            "Matching entity pairs: {}; ranking quality: {:.2}",
            context.match_count, context.deep_match_quality
        );

        if !context.property_mappings.is_empty() {
            out.push_str("\nProperty mappings:\n");
            for m in &context.property_mappings {
                let _ = writeln!(
                    out,
                    "- {} -> {} ({}, quality {:.2}, {} pairs)",
                    m.entity_a_property,
                    m.entity_b_idkey_property,
                    m.match_type,
                    m.value_match_quality,
                    m.count
                );
            }
        }

        if !context.coverage.is_empty() {
            out.push_str("\nProperty coverage:\n");
            for c in &context.coverage {
                let _ = writeln!(
                    out,
                    "- {}.{}: {}/{} populated, {} distinct values",
                    c.entity_type, c.property, c.stats.populated_count, c.stats.entity_count, c.stats.distinct_values
                );
            }
        }

        let mut shown = 0;
        if !context.matching_values.is_empty() {
            out.push_str("\nMatching values (A | B):\n");
            for pair in context.matching_values.iter().take(self.max_examples) {
                let _ = writeln!(
                    out,
                    "- {} | {}",
                    self.render_values(&pair.entity_a_values),
                    self.render_values(&pair.entity_b_values)
                );
                shown += 1;
            }
        }
        if shown == 0 && !context.example_matches.is_empty() {
            out.push_str("\nObserved examples:\n");
            for example in context.example_matches.iter().take(self.max_examples) {
                let _ = writeln!(
                    out,
                    "- {} = {} | {} = {}",
                    example.entity_a,
                    self.truncate(&example.entity_a_value),
                    example.entity_b,
                    self.truncate(&example.entity_b_value)
                );
            }
        }

        if !context.siblings.is_empty() {
            let _ = writeln!(
                out,
                "\nOther candidates from {} to {} (best first):",
                context.entity_a_type, context.entity_b_type
            );
            for s in &context.siblings {
                let verdict = match (&s.relation_name, s.relation_confidence) {
                    (Some(name), Some(confidence)) => format!("{} @ {:.2}", name, confidence),
                    (Some(name), None) => format!("{} (unscored)", name),
                    _ => "not evaluated".to_string(),
                };
                let _ = writeln!(
                    out,
                    "- {} -> {}: {} pairs, quality {:.2}, {}",
                    s.entity_a_property, s.entity_b_idkey_property, s.count, s.deep_match_quality, verdict
                );
            }
        }

        out
    }

    fn render_values(&self, values: &std::collections::BTreeMap<String, PropertyValue>) -> String {
        values
            .iter()
            .map(|(k, v)| format!("{}={}", k, self.truncate(&v.display_string())))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn truncate(&self, value: &str) -> String {
        if value.chars().count() <= self.max_value_length {
            value.to_string()
        } else {
            let cut: String = value.chars().take(self.max_value_length).collect();
            format!("{}...", cut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::{ExampleMatch, PropertyMapping};
    use crate::graph::PropertyValueCount;
    use crate::matching::MatchType;
    use crate::oracle::{PropertyCoverage, SiblingSummary};

    fn context() -> EvaluationContext {
        let mut mapping = PropertyMapping::new("node_name", "name", MatchType::Exact, 1.0);
        mapping.count = 4;
        EvaluationContext {
            relation_id: "r1".into(),
            entity_a_type: "Pod".into(),
            entity_a_property: "node_name".into(),
            entity_b_type: "Node".into(),
            entity_b_idkey_property: "name".into(),
            is_entity_b_idkey_composite: false,
            property_mappings: vec![mapping],
            match_count: 4,
            deep_match_quality: 6.2,
            example_matches: vec![ExampleMatch {
                pair_key: "k".into(),
                entity_a: "Pod[name=api-1]".into(),
                entity_b: "Node[name=worker-1]".into(),
                entity_a_value: "worker-1".into(),
                entity_b_value: "worker-1".into(),
            }],
            matching_values: vec![],
            siblings: vec![SiblingSummary {
                entity_a_property: "host".into(),
                entity_b_idkey_property: "name".into(),
                count: 2,
                deep_match_quality: 3.1,
                relation_name: Some("HAS_NODE".into()),
                relation_confidence: Some(0.4),
            }],
            coverage: vec![PropertyCoverage {
                entity_type: "Pod".into(),
                property: "node_name".into(),
                stats: PropertyValueCount {
                    entity_count: 10,
                    populated_count: 8,
                    distinct_values: 3,
                },
            }],
        }
    }

    #[test]
    fn test_user_prompt_mentions_evidence() {
        let prompt = RelationPromptBuilder::new().user_prompt(&context());
        assert!(prompt.contains("Pod.node_name -> Node.name"));
        assert!(prompt.contains("EXACT"));
        assert!(prompt.contains("8/10 populated"));
        assert!(prompt.contains("Node[name=worker-1]"));
        assert!(prompt.contains("HAS_NODE @ 0.40"));
        assert!(!prompt.contains("composite"));
    }

    #[test]
    fn test_truncate_long_values() {
        let builder = RelationPromptBuilder::new();
        let long = "x".repeat(500);
        let cut = builder.truncate(&long);
        assert_eq!(cut.chars().count(), 123);
        assert!(cut.ends_with("..."));
    }
}
