//! Confidence oracle contract.
//!
//! The evaluation orchestrator hands an [`EvaluationContext`] to a
//! [`ConfidenceOracle`] and gets back an [`OracleVerdict`]. Implementations
//! are treated as slow and unreliable: any error is recorded on the
//! candidate and never replaces a previous evaluation.

pub mod heuristic;
pub mod openai;
pub mod prompt;

pub use heuristic::HeuristicOracle;
pub use openai::OpenAIOracle;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::candidates::{ExampleMatch, PropertyMapping};
use crate::config::OracleConfig;
use crate::error::{Result, ReldiscoError};
use crate::graph::{MatchingValuePair, PropertyValueCount};

/// A sibling candidate between the same two entity types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiblingSummary {
    pub entity_a_property: String,
    pub entity_b_idkey_property: String,
    pub count: u64,
    pub deep_match_quality: f64,
    pub relation_name: Option<String>,
    pub relation_confidence: Option<f64>,
}

/// Population statistics for one property referenced by the candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCoverage {
    pub entity_type: String,
    pub property: String,
    pub stats: PropertyValueCount,
}

/// Everything an oracle sees about one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub relation_id: String,
    pub entity_a_type: String,
    pub entity_a_property: String,
    pub entity_b_type: String,
    pub entity_b_idkey_property: String,
    pub is_entity_b_idkey_composite: bool,
    pub property_mappings: Vec<PropertyMapping>,
    pub match_count: u64,
    pub deep_match_quality: f64,
    pub example_matches: Vec<ExampleMatch>,
    pub matching_values: Vec<MatchingValuePair>,
    pub siblings: Vec<SiblingSummary>,
    pub coverage: Vec<PropertyCoverage>,
}

impl EvaluationContext {
    /// Coverage of the A side properties, averaged. `None` without statistics.
    pub fn source_coverage(&self) -> Option<f64> {
        let values: Vec<f64> = self
            .coverage
            .iter()
            .filter(|c| c.entity_type == self.entity_a_type)
            .map(|c| c.stats.coverage())
            .collect();
        (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// An oracle's answer for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub relation_name: String,
    /// Confidence in [0, 1]; `None` when the oracle declined to score.
    pub relation_confidence: Option<f64>,
    pub justification: String,
    pub thought: Option<String>,
}

#[async_trait]
pub trait ConfidenceOracle: Send + Sync {
    /// Short identifier used in logs and audit metadata.
    fn name(&self) -> &str;

    async fn evaluate(&self, context: &EvaluationContext) -> Result<OracleVerdict>;
}

/// Build the oracle selected by `oracle.provider`.
pub fn from_config(config: &OracleConfig) -> Result<Arc<dyn ConfidenceOracle>> {
    match config.provider.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicOracle::default())),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                ReldiscoError::Config(format!("Environment variable {} not set", config.api_key_env))
            })?;
            Ok(Arc::new(OpenAIOracle::new(api_key, config)?))
        }
        other => Err(ReldiscoError::Config(format!("Unknown oracle provider: {}", other))),
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    relation_name: String,
    #[serde(default)]
    relation_confidence: serde_json::Value,
    #[serde(default)]
    justification: String,
    #[serde(default)]
    thought: Option<String>,
}

/// Parse an oracle's JSON answer.
///
/// Accepts surrounding prose or code fences around the object. A null or
/// missing confidence becomes `None`; numeric strings are accepted; values are
/// clamped to [0, 1]. Anything else is an [`ReldiscoError::Oracle`] error.
pub fn parse_verdict(text: &str) -> Result<OracleVerdict> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(ReldiscoError::Oracle(format!("No JSON object in oracle response: {}", text))),
    };

    let raw: RawVerdict = serde_json::from_str(json)
        .map_err(|e| ReldiscoError::Oracle(format!("Malformed oracle response: {}", e)))?;

    let confidence = match &raw.relation_confidence {
        serde_json::Value::Null => None,
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) if s.trim().is_empty() => None,
        serde_json::Value::String(s) => Some(
            s.trim()
                .parse::<f64>()
                .map_err(|_| ReldiscoError::Oracle(format!("Unparsable confidence: {}", s)))?,
        ),
        other => return Err(ReldiscoError::Oracle(format!("Unparsable confidence: {}", other))),
    };
    let confidence = match confidence {
        Some(c) if c.is_nan() => {
            return Err(ReldiscoError::Oracle("Confidence is not a number".to_string()));
        }
        Some(c) => Some(c.clamp(0.0, 1.0)),
        None => None,
    };

    Ok(OracleVerdict {
        relation_name: raw.relation_name.trim().to_string(),
        relation_confidence: confidence,
        justification: raw.justification,
        thought: raw.thought.filter(|t| !t.trim().is_empty()),
    })
}
