//! Shared helpers for unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::candidates::{pair_key_for, ExampleMatch, HeuristicObservation, PropertyMapping};
use crate::db::Db;
use crate::error::{Result, ReldiscoError};
use crate::matching::MatchType;
use crate::oracle::{ConfidenceOracle, EvaluationContext, OracleVerdict};

pub(crate) fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Fresh, migrated database in a temporary directory. Keep the `TempDir`
/// alive for as long as the database is used.
pub(crate) async fn temp_db() -> (Db, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Db::new(temp_dir.path().join("reldisco.db"));
    db.migrate(migrations_dir()).await.unwrap();
    (db, temp_dir)
}

/// One exact simple-key observation of `a_type[name=a_name].a_prop` against
/// `b_type[b_prop=b_name]`.
pub(crate) fn simple_observation(
    a_type: &str,
    a_prop: &str,
    b_type: &str,
    b_prop: &str,
    a_name: &str,
    b_name: &str,
) -> HeuristicObservation {
    let a_sig = format!("{}[name={}]", a_type, a_name);
    let b_sig = format!("{}[{}={}]", b_type, b_prop, b_name);
    HeuristicObservation {
        entity_a_type: a_type.to_string(),
        entity_a_property: a_prop.to_string(),
        entity_b_type: b_type.to_string(),
        entity_b_idkey_property: b_prop.to_string(),
        is_entity_b_idkey_composite: false,
        property_mappings: vec![PropertyMapping::new(a_prop, b_prop, MatchType::Exact, 1.0)],
        deep_match_quality: 6.0,
        example: ExampleMatch {
            pair_key: pair_key_for(&a_sig, &b_sig),
            entity_a: a_sig,
            entity_b: b_sig,
            entity_a_value: b_name.to_string(),
            entity_b_value: b_name.to_string(),
        },
    }
}

/// Oracle returning queued answers, then a fixed default, counting calls.
pub(crate) struct ScriptedOracle {
    answers: Mutex<VecDeque<std::result::Result<OracleVerdict, String>>>,
    default_confidence: Option<f64>,
    calls: AtomicUsize,
    seen: Mutex<Vec<EvaluationContext>>,
}

impl ScriptedOracle {
    pub(crate) fn new(default_confidence: Option<f64>) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            default_confidence,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_verdict(&self, relation_name: &str, confidence: Option<f64>) {
        self.answers.lock().unwrap().push_back(Ok(verdict(relation_name, confidence)));
    }

    pub(crate) fn push_error(&self, message: &str) {
        self.answers.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts(&self) -> Vec<EvaluationContext> {
        self.seen.lock().unwrap().clone()
    }
}

fn verdict(relation_name: &str, confidence: Option<f64>) -> OracleVerdict {
    OracleVerdict {
        relation_name: relation_name.to_string(),
        relation_confidence: confidence,
        justification: "scripted".to_string(),
        thought: None,
    }
}

#[async_trait]
impl ConfidenceOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(&self, context: &EvaluationContext) -> Result<OracleVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(context.clone());
        match self.answers.lock().unwrap().pop_front() {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(message)) => Err(ReldiscoError::Oracle(message)),
            None => Ok(verdict("", self.default_confidence)),
        }
    }
}

/// Oracle that holds each call until released, for ordering concurrent
/// evaluations.
pub(crate) struct GatedOracle {
    answer: OracleVerdict,
    entered: Notify,
    release: Notify,
}

impl GatedOracle {
    pub(crate) fn new(relation_name: &str, confidence: Option<f64>) -> Self {
        Self {
            answer: verdict(relation_name, confidence),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Resolves once a call is waiting on the gate.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl ConfidenceOracle for GatedOracle {
    fn name(&self) -> &str {
        "gated"
    }

    async fn evaluate(&self, _context: &EvaluationContext) -> Result<OracleVerdict> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.answer.clone())
    }
}
