//! Persistent owner of relation candidate state.
//!
//! Every mutation runs as one `IMMEDIATE` SQLite transaction behind the
//! manager's write gate, so concurrent heuristics and evaluation workers
//! never interleave a read-modify-write on the same candidate. Graph store
//! edges are reconciled against `synced_relation_name` under a separate
//! sync gate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use tokio::sync::Mutex;

use super::audit::{self, OperationType};
use super::{
    default_relation_name, normalize_relation_name, ExampleMatch, FKeyHeuristic, HeuristicObservation,
    HeuristicsVersion, PropertyMapping, RelationCandidate, RelationEvaluation,
};
use crate::db::Db;
use crate::error::{Result, ReldiscoError};
use crate::graph::{EdgeFilter, GraphStore};

const CANDIDATE_COLUMNS: &str = "relation_id, entity_a_type, entity_a_property, entity_b_type, \
     entity_b_idkey_property, is_entity_b_idkey_composite, property_mappings_json, match_count, \
     example_matches_json, deep_match_quality, relation_name, relation_confidence, justification, \
     thought, last_evaluation_count, evaluated_at, evaluation_error, manually_accepted, \
     manually_rejected, applied, synced_relation_name, heuristics_version_id, created_at, updated_at";

/// Current heuristics run token and its timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeuristicsState {
    pub version: HeuristicsVersion,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl HeuristicsState {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// What a sync call changed in the graph store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    Unchanged,
    Related { relation_name: String, edges_created: usize },
    Removed { relation_name: String, edges_removed: usize },
    Renamed { from: String, to: String, edges_created: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub checked: usize,
    pub synced: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    /// True when no completed run exists and nothing was pruned.
    pub skipped: bool,
    pub pruned: usize,
    pub retained_manual: usize,
    pub observations_dropped: usize,
    pub edges_removed: usize,
    /// Stale candidates kept because their edge could not be removed.
    pub prune_failures: usize,
}

fn row_to_candidate(row: &Row) -> Result<RelationCandidate> {
    let mappings_json: String = row.get(6)?;
    let examples_json: String = row.get(8)?;
    let evaluated_at: Option<String> = row.get(15)?;

    let evaluation = if evaluated_at.is_some() {
        Some(RelationEvaluation {
            relation_name: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            relation_confidence: row.get(11)?,
            justification: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            thought: row.get(13)?,
            last_evaluation_count: row.get::<_, Option<i64>>(14)?.unwrap_or(0).max(0) as u64,
        })
    } else {
        None
    };

    let mappings: Vec<PropertyMapping> = serde_json::from_str(&mappings_json)?;
    let examples: Vec<ExampleMatch> = serde_json::from_str(&examples_json)?;

    Ok(RelationCandidate {
        relation_id: row.get(0)?,
        heuristic: FKeyHeuristic {
            entity_a_type: row.get(1)?,
            entity_a_property: row.get(2)?,
            entity_b_type: row.get(3)?,
            entity_b_idkey_property: row.get(4)?,
            is_entity_b_idkey_composite: row.get(5)?,
            property_mappings: mappings,
            count: row.get::<_, i64>(7)?.max(0) as u64,
            example_matches: examples,
            deep_match_quality: row.get(9)?,
        },
        evaluation,
        evaluated_at,
        evaluation_error: row.get(16)?,
        manually_accepted: row.get(17)?,
        manually_rejected: row.get(18)?,
        applied: row.get(19)?,
        synced_relation_name: row.get(20)?,
        heuristics_version_id: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

fn query_candidates<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<RelationCandidate>> {
    let sql = format!("SELECT {} FROM relation_candidates {}", CANDIDATE_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    let mut candidates = Vec::new();
    while let Some(row) = rows.next()? {
        candidates.push(row_to_candidate(row)?);
    }
    Ok(candidates)
}

fn load_candidate(conn: &Connection, relation_id: &str) -> Result<Option<RelationCandidate>> {
    Ok(query_candidates(conn, "WHERE relation_id = ?1", params![relation_id])?
        .into_iter()
        .next())
}

fn require_candidate(conn: &Connection, relation_id: &str) -> Result<RelationCandidate> {
    load_candidate(conn, relation_id)?.ok_or_else(|| ReldiscoError::CandidateNotFound(relation_id.to_string()))
}

fn write_heuristic(tx: &Transaction<'_>, relation_id: &str, heuristic: &FKeyHeuristic, version: &str) -> Result<()> {
    tx.execute(
        r#"
        UPDATE relation_candidates SET
            entity_b_idkey_property = ?2,
            property_mappings_json = ?3,
            match_count = ?4,
            example_matches_json = ?5,
            deep_match_quality = ?6,
            heuristics_version_id = ?7,
            updated_at = ?8
        WHERE relation_id = ?1
        "#,
        params![
            relation_id,
            heuristic.entity_b_idkey_property,
            serde_json::to_string(&heuristic.property_mappings)?,
            heuristic.count as i64,
            serde_json::to_string(&heuristic.example_matches)?,
            heuristic.deep_match_quality,
            version,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Recount evidence for candidates that lost observations.
fn rebuild_evidence(tx: &Transaction<'_>, relation_ids: &[String], version: &str) -> Result<()> {
    for relation_id in relation_ids {
        let Some(mut candidate) = load_candidate(tx, relation_id)? else {
            continue;
        };
        let mut stmt = tx.prepare(
            "SELECT pair_key, mapping_keys_json FROM heuristic_observations WHERE relation_id = ?1",
        )?;
        let mut rows = stmt.query(params![relation_id])?;
        let mut observed = Vec::new();
        while let Some(row) = rows.next()? {
            let keys_json: String = row.get(1)?;
            observed.push((row.get::<_, String>(0)?, serde_json::from_str::<Vec<String>>(&keys_json)?));
        }
        candidate.heuristic.retain_observed(&observed);
        write_heuristic(tx, relation_id, &candidate.heuristic, version)?;
    }
    Ok(())
}

pub struct CandidateManager {
    db: Db,
    graph: Arc<dyn GraphStore>,
    write_gate: Mutex<()>,
    sync_gate: Mutex<()>,
    example_match_limit: usize,
}

impl CandidateManager {
    pub fn new(db: Db, graph: Arc<dyn GraphStore>, example_match_limit: usize) -> Self {
        Self {
            db,
            graph,
            write_gate: Mutex::new(()),
            sync_gate: Mutex::new(()),
            example_match_limit,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    /// Run `f` inside an IMMEDIATE transaction, serialised with every other
    /// writer of this manager. The transaction commits even if the caller's
    /// future is dropped once the blocking task has started.
    async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _gate = self.write_gate.lock().await;
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await
    }

    pub async fn fetch_candidate(&self, relation_id: &str) -> Result<Option<RelationCandidate>> {
        let id = relation_id.to_string();
        self.db.with_connection(move |conn| load_candidate(conn, &id)).await
    }

    pub async fn fetch_all_candidates(&self) -> Result<BTreeMap<String, RelationCandidate>> {
        let candidates = self
            .db
            .with_connection(|conn| query_candidates(conn, "ORDER BY relation_id", []))
            .await?;
        Ok(candidates
            .into_iter()
            .map(|c| (c.relation_id.clone(), c))
            .collect())
    }

    /// Other candidates between the same entity types, best ranked first.
    pub async fn fetch_siblings(
        &self,
        entity_a_type: &str,
        entity_b_type: &str,
        exclude_relation_id: &str,
        limit: usize,
    ) -> Result<Vec<RelationCandidate>> {
        let (a, b, exclude) = (
            entity_a_type.to_string(),
            entity_b_type.to_string(),
            exclude_relation_id.to_string(),
        );
        self.db
            .with_connection(move |conn| {
                query_candidates(
                    conn,
                    "WHERE entity_a_type = ?1 AND entity_b_type = ?2 AND relation_id != ?3 \
                     ORDER BY deep_match_quality DESC, relation_id LIMIT ?4",
                    params![a, b, exclude, limit as i64],
                )
            })
            .await
    }

    pub async fn heuristics_state(&self) -> Result<Option<HeuristicsState>> {
        self.db
            .with_connection(|conn| {
                let state = conn
                    .query_row(
                        "SELECT version_id, started_at, completed_at FROM heuristics_state WHERE id = 1",
                        [],
                        |row| {
                            Ok(HeuristicsState {
                                version: HeuristicsVersion::from(row.get::<_, String>(0)?),
                                started_at: row.get(1)?,
                                completed_at: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(state)
            })
            .await
    }

    pub async fn current_heuristics_version(&self) -> Result<Option<HeuristicsVersion>> {
        Ok(self.heuristics_state().await?.map(|s| s.version))
    }

    /// Start a new heuristics run and make its token current.
    pub async fn begin_heuristics_run(&self) -> Result<HeuristicsVersion> {
        let version = HeuristicsVersion::generate();
        let id = version.as_str().to_string();
        self.write(move |tx| {
            tx.execute(
                r#"
                INSERT INTO heuristics_state (id, version_id, started_at, completed_at)
                VALUES (1, ?1, ?2, NULL)
                ON CONFLICT(id) DO UPDATE SET
                    version_id = excluded.version_id,
                    started_at = excluded.started_at,
                    completed_at = NULL
                "#,
                params![id, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await?;
        info!("Started heuristics run {}", version);
        Ok(version)
    }

    /// Mark `version` complete. Fails if another run has since become current.
    pub async fn complete_heuristics_run(&self, version: &HeuristicsVersion) -> Result<()> {
        let id = version.as_str().to_string();
        let updated = self
            .write(move |tx| {
                Ok(tx.execute(
                    "UPDATE heuristics_state SET completed_at = ?2 WHERE id = 1 AND version_id = ?1",
                    params![id, Utc::now().to_rfc3339()],
                )?)
            })
            .await?;
        if updated == 0 {
            return Err(ReldiscoError::InvalidInput(format!(
                "heuristics run {} is not the current run",
                version
            )));
        }
        info!("Completed heuristics run {}", version);
        Ok(())
    }

    /// Create or merge evidence for the observation's candidate and stamp it
    /// with `version`. Returns the candidate's relation_id.
    pub async fn upsert_heuristic(
        &self,
        version: &HeuristicsVersion,
        observation: &HeuristicObservation,
    ) -> Result<String> {
        let relation_id = observation.relation_id();
        let observation = observation.clone();
        let version = version.as_str().to_string();
        let limit = self.example_match_limit;
        let id = relation_id.clone();

        self.write(move |tx| {
            let now = Utc::now().to_rfc3339();
            let mut heuristic = match load_candidate(tx, &id)? {
                Some(existing) => existing.heuristic,
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO relation_candidates (
                            relation_id, entity_a_type, entity_a_property, entity_b_type,
                            entity_b_idkey_property, is_entity_b_idkey_composite,
                            heuristics_version_id, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                        "#,
                        params![
                            id,
                            observation.entity_a_type,
                            observation.entity_a_property,
                            observation.entity_b_type,
                            observation.entity_b_idkey_property,
                            observation.is_entity_b_idkey_composite,
                            version,
                            now,
                        ],
                    )?;
                    debug!(
                        "New relation candidate {}.{} -> {}.{}",
                        observation.entity_a_type,
                        observation.entity_a_property,
                        observation.entity_b_type,
                        observation.entity_b_idkey_property
                    );
                    observation.empty_heuristic()
                }
            };

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO heuristic_observations \
                 (relation_id, pair_key, heuristics_version_id, mapping_keys_json) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id,
                    observation.pair_key(),
                    version,
                    serde_json::to_string(&observation.mapping_keys())?
                ],
            )?;
            if inserted == 0 {
                tx.execute(
                    "UPDATE heuristic_observations SET heuristics_version_id = ?3 \
                     WHERE relation_id = ?1 AND pair_key = ?2",
                    params![id, observation.pair_key(), version],
                )?;
            }

            heuristic.absorb(&observation, inserted > 0, limit);
            write_heuristic(tx, &id, &heuristic, &version)?;
            Ok(())
        })
        .await?;

        Ok(relation_id)
    }

    /// Draw the next evaluation ticket for a candidate. Read the candidate
    /// only after drawing, so a later ticket never sees older evidence.
    pub async fn begin_evaluation(&self, relation_id: &str) -> Result<u64> {
        let id = relation_id.to_string();
        self.write(move |tx| {
            let updated = tx.execute(
                "UPDATE relation_candidates SET evaluation_ticket = evaluation_ticket + 1 WHERE relation_id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(ReldiscoError::CandidateNotFound(id));
            }
            let ticket: i64 = tx.query_row(
                "SELECT evaluation_ticket FROM relation_candidates WHERE relation_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(ticket as u64)
        })
        .await
    }

    /// Record an oracle verdict drawn under `ticket`, clearing any previous
    /// evaluation error. Returns false, storing nothing, when a verdict from
    /// a later ticket is already stored.
    pub async fn update_evaluation(&self, relation_id: &str, evaluation: &RelationEvaluation, ticket: u64) -> Result<bool> {
        let id = relation_id.to_string();
        let evaluation = evaluation.clone();
        self.write(move |tx| {
            let candidate = require_candidate(tx, &id)?;
            let stored: i64 = tx.query_row(
                "SELECT evaluated_ticket FROM relation_candidates WHERE relation_id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if (ticket as i64) <= stored {
                return Ok(false);
            }
            let name = match normalize_relation_name(&evaluation.relation_name) {
                name if name.is_empty() => default_relation_name(&candidate.heuristic.entity_b_type),
                name => name,
            };
            let now = Utc::now().to_rfc3339();
            tx.execute(
                r#"
                UPDATE relation_candidates SET
                    relation_name = ?2,
                    relation_confidence = ?3,
                    justification = ?4,
                    thought = ?5,
                    last_evaluation_count = ?6,
                    evaluated_at = ?7,
                    evaluated_ticket = ?8,
                    evaluation_error = NULL,
                    updated_at = ?7
                WHERE relation_id = ?1
                "#,
                params![
                    id,
                    name,
                    evaluation.relation_confidence,
                    evaluation.justification,
                    evaluation.thought,
                    evaluation.last_evaluation_count as i64,
                    now,
                    ticket as i64,
                ],
            )?;
            Ok(true)
        })
        .await
    }

    /// Record a failed evaluation. The previous evaluation is left untouched.
    pub async fn record_evaluation_error(&self, relation_id: &str, error: &str) -> Result<()> {
        let id = relation_id.to_string();
        let error = error.to_string();
        self.write(move |tx| {
            let updated = tx.execute(
                "UPDATE relation_candidates SET evaluation_error = ?2, updated_at = ?3 WHERE relation_id = ?1",
                params![id, error, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                return Err(ReldiscoError::CandidateNotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Mark the relation accepted and sync its edge.
    ///
    /// A non-manual apply never overrides a manual rejection.
    pub async fn apply_relation(&self, actor: &str, relation_id: &str, manual: bool) -> Result<()> {
        let id = relation_id.to_string();
        let changed = self
            .write(move |tx| {
                let candidate = require_candidate(tx, &id)?;
                if manual {
                    tx.execute(
                        "UPDATE relation_candidates SET applied = 1, manually_accepted = 1, \
                         manually_rejected = 0, updated_at = ?2 WHERE relation_id = ?1",
                        params![id, Utc::now().to_rfc3339()],
                    )?;
                    Ok(true)
                } else if candidate.manually_rejected {
                    Ok(false)
                } else {
                    tx.execute(
                        "UPDATE relation_candidates SET applied = 1, updated_at = ?2 WHERE relation_id = ?1",
                        params![id, Utc::now().to_rfc3339()],
                    )?;
                    Ok(true)
                }
            })
            .await;

        self.audit_decision(OperationType::Accept, relation_id, actor, manual, &changed)
            .await;
        if changed? {
            self.sync_after_decision(actor, relation_id).await?;
        } else {
            debug!("Candidate {} is manually rejected; automatic accept ignored", relation_id);
        }
        Ok(())
    }

    /// Clear the accepted state and remove the edge if one is materialised.
    ///
    /// With `manual` the candidate is marked rejected; otherwise it is only
    /// un-applied, and a manual acceptance is left alone.
    pub async fn unapply_relation(&self, relation_id: &str, manual: bool) -> Result<()> {
        let actor = if manual { "operator" } else { "evaluation" };
        let id = relation_id.to_string();
        let changed = self
            .write(move |tx| {
                let candidate = require_candidate(tx, &id)?;
                if manual {
                    tx.execute(
                        "UPDATE relation_candidates SET applied = 0, manually_rejected = 1, \
                         manually_accepted = 0, updated_at = ?2 WHERE relation_id = ?1",
                        params![id, Utc::now().to_rfc3339()],
                    )?;
                    Ok(true)
                } else if candidate.manually_accepted {
                    Ok(false)
                } else {
                    tx.execute(
                        "UPDATE relation_candidates SET applied = 0, updated_at = ?2 WHERE relation_id = ?1",
                        params![id, Utc::now().to_rfc3339()],
                    )?;
                    Ok(true)
                }
            })
            .await;

        self.audit_decision(OperationType::Reject, relation_id, actor, manual, &changed)
            .await;
        if changed? {
            self.sync_after_decision(actor, relation_id).await?;
        } else {
            debug!("Candidate {} is manually accepted; automatic un-apply ignored", relation_id);
        }
        Ok(())
    }

    /// Lift a manual rejection so the candidate is evaluated again.
    pub async fn unreject(&self, actor: &str, relation_id: &str) -> Result<()> {
        let id = relation_id.to_string();
        let result = self
            .write(move |tx| {
                require_candidate(tx, &id)?;
                tx.execute(
                    "UPDATE relation_candidates SET manually_rejected = 0, updated_at = ?2 WHERE relation_id = ?1",
                    params![id, Utc::now().to_rfc3339()],
                )?;
                Ok(true)
            })
            .await;
        self.audit_decision(OperationType::Unreject, relation_id, actor, true, &result)
            .await;
        result?;
        self.sync_after_decision(actor, relation_id).await
    }

    /// Make the graph store's edge match the candidate's decision state.
    pub async fn sync_relation(&self, actor: &str, relation_id: &str) -> Result<SyncOutcome> {
        let _sync = self.sync_gate.lock().await;

        let candidate = self
            .fetch_candidate(relation_id)
            .await?
            .ok_or_else(|| ReldiscoError::CandidateNotFound(relation_id.to_string()))?;
        let desired = candidate.desired_relation_name();
        let current = candidate.synced_relation_name.clone();
        if desired == current {
            return Ok(SyncOutcome::Unchanged);
        }

        let result = self.reconcile(actor, &candidate, current.clone(), desired.clone()).await;
        let metadata = serde_json::json!({ "from": current, "to": desired });
        let logged = match &result {
            Ok(_) => {
                audit::log_operation(&self.db, OperationType::Sync, relation_id, actor, true, None, Some(metadata))
                    .await
            }
            Err(e) => {
                warn!("Sync of candidate {} failed: {}", relation_id, e);
                audit::log_operation(
                    &self.db,
                    OperationType::Sync,
                    relation_id,
                    actor,
                    false,
                    Some(&e.to_string()),
                    Some(metadata),
                )
                .await
            }
        };
        if let Err(e) = logged {
            warn!("Failed to audit sync of {}: {}", relation_id, e);
        }
        result
    }

    async fn reconcile(
        &self,
        actor: &str,
        candidate: &RelationCandidate,
        current: Option<String>,
        desired: Option<String>,
    ) -> Result<SyncOutcome> {
        let heuristic = &candidate.heuristic;
        let filter = EdgeFilter::owned_by(&candidate.relation_id);

        let mut edges_removed = 0;
        if let Some(old) = &current {
            edges_removed = self.graph.remove_relation(old, &filter).await?;
            self.set_synced(&candidate.relation_id, None).await?;
        }

        match (current, desired) {
            (current, Some(name)) => {
                let edges_created = self
                    .graph
                    .relate_entities_by_property(
                        actor,
                        &candidate.relation_id,
                        &heuristic.entity_a_type,
                        &heuristic.entity_b_type,
                        &name,
                        &heuristic.matching_properties(),
                    )
                    .await?;
                self.set_synced(&candidate.relation_id, Some(name.clone())).await?;
                info!(
                    "Synced {} -[{}]-> {} ({} new edges)",
                    heuristic.entity_a_type, name, heuristic.entity_b_type, edges_created
                );
                Ok(match current {
                    Some(from) => SyncOutcome::Renamed {
                        from,
                        to: name,
                        edges_created,
                    },
                    None => SyncOutcome::Related {
                        relation_name: name,
                        edges_created,
                    },
                })
            }
            (Some(old), None) => {
                info!(
                    "Removed {} -[{}]-> {} ({} edges)",
                    heuristic.entity_a_type, old, heuristic.entity_b_type, edges_removed
                );
                Ok(SyncOutcome::Removed {
                    relation_name: old,
                    edges_removed,
                })
            }
            (None, None) => Ok(SyncOutcome::Unchanged),
        }
    }

    async fn set_synced(&self, relation_id: &str, relation_name: Option<String>) -> Result<()> {
        let id = relation_id.to_string();
        self.write(move |tx| {
            tx.execute(
                "UPDATE relation_candidates SET synced_relation_name = ?2 WHERE relation_id = ?1",
                params![id, relation_name],
            )?;
            Ok(())
        })
        .await
    }

    /// Reconcile every candidate whose edge state differs from its decision.
    pub async fn sync_pending(&self, actor: &str) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for candidate in self.fetch_all_candidates().await?.into_values() {
            summary.checked += 1;
            if !candidate.needs_sync() {
                continue;
            }
            match self.sync_relation(actor, &candidate.relation_id).await {
                Ok(_) => summary.synced += 1,
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(_) => summary.failed += 1,
            }
        }
        if summary.synced > 0 || summary.failed > 0 {
            info!(
                "Sync pass: {} checked, {} synced, {} failed",
                summary.checked, summary.synced, summary.failed
            );
        }
        Ok(summary)
    }

    /// Prune candidates not touched by the current, completed heuristics run.
    ///
    /// Manually accepted candidates are kept. A pruned candidate's edge is
    /// removed first; if that fails the candidate survives until the next
    /// cleanup.
    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        let Some(state) = self.heuristics_state().await? else {
            info!("No heuristics run recorded; nothing to clean up");
            return Ok(CleanupSummary {
                skipped: true,
                ..CleanupSummary::default()
            });
        };
        if !state.is_complete() {
            info!("Heuristics run {} has not completed; skipping cleanup", state.version);
            return Ok(CleanupSummary {
                skipped: true,
                ..CleanupSummary::default()
            });
        }

        let current = state.version.as_str().to_string();
        let stale_query = current.clone();
        let stale = self
            .db
            .with_connection(move |conn| {
                query_candidates(conn, "WHERE heuristics_version_id != ?1", params![stale_query])
            })
            .await?;

        let mut summary = CleanupSummary::default();
        let mut prunable = Vec::new();
        for candidate in stale {
            if candidate.manually_accepted {
                summary.retained_manual += 1;
                continue;
            }
            if let Some(name) = &candidate.synced_relation_name {
                match self.graph.remove_relation(name, &EdgeFilter::owned_by(&candidate.relation_id)).await {
                    Ok(removed) => summary.edges_removed += removed,
                    Err(e) if e.is_fatal_for_run() => return Err(e),
                    Err(e) => {
                        warn!("Keeping stale candidate {}: edge removal failed: {}", candidate.relation_id, e);
                        summary.prune_failures += 1;
                        continue;
                    }
                }
            }
            prunable.push(candidate.relation_id);
        }

        let (pruned, dropped) = self
            .write(move |tx| {
                let mut pruned = Vec::new();
                for id in &prunable {
                    let deleted = tx.execute(
                        "DELETE FROM relation_candidates \
                         WHERE relation_id = ?1 AND heuristics_version_id != ?2 AND manually_accepted = 0",
                        params![id, current],
                    )?;
                    if deleted > 0 {
                        pruned.push(id.clone());
                    } else {
                        // Re-observed while its edge was being removed.
                        tx.execute(
                            "UPDATE relation_candidates SET synced_relation_name = NULL WHERE relation_id = ?1",
                            params![id],
                        )?;
                    }
                }

                let affected: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT DISTINCT o.relation_id FROM heuristic_observations o \
                         JOIN relation_candidates c ON c.relation_id = o.relation_id \
                         WHERE o.heuristics_version_id != ?1 AND c.heuristics_version_id = ?1",
                    )?;
                    let ids = stmt
                        .query_map(params![current], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                    ids
                };
                let dropped = tx.execute(
                    "DELETE FROM heuristic_observations WHERE heuristics_version_id != ?1 \
                     AND relation_id IN (SELECT relation_id FROM relation_candidates WHERE heuristics_version_id = ?1)",
                    params![current],
                )?;
                rebuild_evidence(tx, &affected, &current)?;
                Ok((pruned, dropped))
            })
            .await?;

        for id in &pruned {
            if let Err(e) = audit::log_operation(&self.db, OperationType::Prune, id, "cleanup", true, None, None).await {
                warn!("Failed to audit prune of {}: {}", id, e);
            }
        }

        summary.pruned = pruned.len();
        summary.observations_dropped = dropped;
        info!(
            "Cleanup: {} pruned, {} kept (manual), {} stale observations dropped, {} edges removed",
            summary.pruned, summary.retained_manual, summary.observations_dropped, summary.edges_removed
        );
        Ok(summary)
    }

    /// Sync, deferring non-fatal graph store failures to the next
    /// reconciliation pass.
    pub(crate) async fn sync_after_decision(&self, actor: &str, relation_id: &str) -> Result<()> {
        match self.sync_relation(actor, relation_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal_for_run() => Err(e),
            Err(e) => {
                warn!(
                    "Candidate {} decision stored; edge sync deferred: {}",
                    relation_id, e
                );
                Ok(())
            }
        }
    }

    async fn audit_decision(
        &self,
        operation: OperationType,
        relation_id: &str,
        actor: &str,
        manual: bool,
        result: &Result<bool>,
    ) {
        let metadata = Some(serde_json::json!({ "manual": manual }));
        let logged = match result {
            Ok(applied) => {
                let metadata = Some(serde_json::json!({ "manual": manual, "changed": applied }));
                audit::log_operation(&self.db, operation, relation_id, actor, true, None, metadata).await
            }
            Err(e) => {
                audit::log_operation(&self.db, operation, relation_id, actor, false, Some(&e.to_string()), metadata)
                    .await
            }
        };
        if let Err(e) = logged {
            warn!("Failed to audit {} of {}: {}", operation.as_str(), relation_id, e);
        }
    }
}
