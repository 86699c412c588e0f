use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::context::ContextBuilder;
use super::policy::{Decision, EvaluationPolicy, SkipReason};
use crate::candidates::audit::{self, OperationType};
use crate::candidates::{CandidateManager, RelationEvaluation};
use crate::error::{Result, ReldiscoError};
use crate::oracle::ConfidenceOracle;

const EVALUATION_ACTOR: &str = "evaluation";

/// Result of evaluating one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EvaluationOutcome {
    Skipped(SkipReason),
    Evaluated { confidence: f64, accepted: bool },
    /// The oracle or context lookup failed; the previous evaluation stands.
    Failed(String),
}

/// Totals for one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationRunSummary {
    pub candidates: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub accepted: usize,
}

pub struct EvaluationOrchestrator {
    manager: Arc<CandidateManager>,
    oracle: Arc<dyn ConfidenceOracle>,
    contexts: ContextBuilder,
    policy: EvaluationPolicy,
    max_concurrent: usize,
}

impl EvaluationOrchestrator {
    pub fn new(
        manager: Arc<CandidateManager>,
        oracle: Arc<dyn ConfidenceOracle>,
        contexts: ContextBuilder,
        policy: EvaluationPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            manager,
            oracle,
            contexts,
            policy,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn policy(&self) -> &EvaluationPolicy {
        &self.policy
    }

    /// Apply the skip policy to one candidate and, if it passes, score it.
    ///
    /// A confidence at or above the acceptance threshold applies the
    /// relation. A candidate auto-applied earlier that now scores below it
    /// is un-applied; manual acceptances are left alone.
    pub async fn evaluate(&self, relation_id: &str, force: bool) -> Result<EvaluationOutcome> {
        let candidate = self
            .manager
            .fetch_candidate(relation_id)
            .await?
            .ok_or_else(|| ReldiscoError::CandidateNotFound(relation_id.to_string()))?;

        if let Decision::Skip(reason) = self.policy.decide(&candidate, force) {
            debug!("Skipping evaluation of {}: {}", relation_id, reason);
            return Ok(EvaluationOutcome::Skipped(reason));
        }

        let ticket = self.manager.begin_evaluation(relation_id).await?;
        let candidate = self
            .manager
            .fetch_candidate(relation_id)
            .await?
            .ok_or_else(|| ReldiscoError::CandidateNotFound(relation_id.to_string()))?;

        let verdict = match self.contexts.build(&candidate).await {
            Ok(context) => self.oracle.evaluate(&context).await,
            Err(e) => Err(e),
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) if e.is_fatal_for_run() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                warn!("Evaluation of {} failed: {}", relation_id, message);
                self.manager.record_evaluation_error(relation_id, &message).await?;
                self.audit(relation_id, false, Some(&message), None).await;
                return Ok(EvaluationOutcome::Failed(message));
            }
        };

        let confidence = verdict.relation_confidence.unwrap_or(0.0);
        let evaluation = RelationEvaluation {
            relation_name: verdict.relation_name,
            relation_confidence: verdict.relation_confidence,
            justification: verdict.justification,
            thought: verdict.thought,
            last_evaluation_count: candidate.heuristic.count,
        };
        if !self.manager.update_evaluation(relation_id, &evaluation, ticket).await? {
            info!(
                "Discarding evaluation of {} at count {}: a newer evaluation is already stored",
                relation_id, evaluation.last_evaluation_count
            );
            return Ok(EvaluationOutcome::Skipped(SkipReason::Superseded));
        }

        let accepted = self.policy.is_accepted(confidence);
        if accepted {
            self.manager.apply_relation(EVALUATION_ACTOR, relation_id, false).await?;
        } else if candidate.applied && !candidate.manually_accepted {
            self.manager.unapply_relation(relation_id, false).await?;
        } else if candidate.applied {
            // A manual acceptance keeps its edge but follows a renamed label.
            self.manager.sync_after_decision(EVALUATION_ACTOR, relation_id).await?;
        }

        self.audit(
            relation_id,
            true,
            None,
            Some(serde_json::json!({
                "oracle": self.oracle.name(),
                "confidence": evaluation.relation_confidence,
                "count": evaluation.last_evaluation_count,
                "forced": force,
            })),
        )
        .await;
        info!(
            "Evaluated {}.{} -> {}: confidence {:.2}{}",
            candidate.heuristic.entity_a_type,
            candidate.heuristic.entity_a_property,
            candidate.heuristic.entity_b_type,
            confidence,
            if accepted { " (accepted)" } else { "" }
        );
        Ok(EvaluationOutcome::Evaluated { confidence, accepted })
    }

    /// Evaluate every candidate through a pool of `max_concurrent` tasks.
    pub async fn evaluate_all(&self, force: bool, cancel: &CancellationToken) -> Result<EvaluationRunSummary> {
        let ids: Vec<String> = self.manager.fetch_all_candidates().await?.into_keys().collect();
        let mut summary = EvaluationRunSummary {
            candidates: ids.len(),
            ..EvaluationRunSummary::default()
        };

        let mut results = std::pin::pin!(stream::iter(ids)
            .map(|relation_id| {
                async move {
                    if cancel.is_cancelled() {
                        return Err(ReldiscoError::Cancelled);
                    }
                    match self.evaluate(&relation_id, force).await {
                        Ok(outcome) => Ok(outcome),
                        Err(e) if e.is_fatal_for_run() => Err(e),
                        Err(ReldiscoError::CandidateNotFound(id)) => {
                            debug!("Candidate {} disappeared before evaluation", id);
                            Ok(EvaluationOutcome::Skipped(SkipReason::Missing))
                        }
                        Err(e) => {
                            warn!("Evaluation of {} failed: {}", relation_id, e);
                            Ok(EvaluationOutcome::Failed(e.to_string()))
                        }
                    }
                }
                .boxed()
            })
            .buffer_unordered(self.max_concurrent));

        while let Some(result) = results.next().await {
            match result? {
                EvaluationOutcome::Skipped(_) => summary.skipped += 1,
                EvaluationOutcome::Evaluated { accepted, .. } => {
                    summary.evaluated += 1;
                    if accepted {
                        summary.accepted += 1;
                    }
                }
                EvaluationOutcome::Failed(_) => summary.failed += 1,
            }
        }

        info!(
            "Evaluation pass: {} candidates, {} evaluated, {} accepted, {} skipped, {} failed",
            summary.candidates, summary.evaluated, summary.accepted, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    async fn audit(&self, relation_id: &str, success: bool, error: Option<&str>, metadata: Option<serde_json::Value>) {
        if let Err(e) = audit::log_operation(
            self.manager.db(),
            OperationType::Evaluate,
            relation_id,
            EVALUATION_ACTOR,
            success,
            error,
            metadata,
        )
        .await
        {
            warn!("Failed to audit evaluation of {}: {}", relation_id, e);
        }
    }
}
