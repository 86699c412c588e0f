//! Control layer: the operations an admin surface drives, full runs and the
//! periodic scheduler.
//!
//! Bulk operations (`process_all`, `evaluate_all`, `process_and_evaluate_all`,
//! `cleanup`) hold the run flag, so at most one of them is active at a time.
//! Single-candidate operations bypass it and rely on the candidate manager's
//! per-candidate transactions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::PropertyStatsCache;
use crate::candidates::audit::{self, OperationRecord};
use crate::candidates::{
    CandidateManager, CleanupSummary, HeuristicsVersion, RelationCandidate, SyncOutcome, SyncSummary,
};
use crate::config::Config;
use crate::db::Db;
use crate::error::{Result, ReldiscoError};
use crate::evaluation::{
    ContextBuilder, EvaluationOrchestrator, EvaluationOutcome, EvaluationPolicy, EvaluationRunSummary,
};
use crate::graph::{GraphStore, SqliteGraphStore};
use crate::heuristics::{self, HeuristicsProcessor, ProcessRunSummary};
use crate::oracle::{self, ConfidenceOracle};

const OPERATOR_ACTOR: &str = "operator";
const SCHEDULER_ACTOR: &str = "scheduler";

/// Knobs for one full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullRunOptions {
    pub evaluate: bool,
    pub force: bool,
    pub cleanup: bool,
}

impl Default for FullRunOptions {
    fn default() -> Self {
        Self {
            evaluate: true,
            force: false,
            cleanup: true,
        }
    }
}

/// Totals for a heuristics + cleanup + evaluation + sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullRunSummary {
    pub version: HeuristicsVersion,
    pub heuristics: ProcessRunSummary,
    pub cleanup: Option<CleanupSummary>,
    pub evaluation: Option<EvaluationRunSummary>,
    pub sync: SyncSummary,
}

struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Clears the run flag when the bulk operation holding it ends, however it ends.
pub(crate) struct RunGuard<'a> {
    engine: &'a RelationDiscoveryEngine,
    cancel: CancellationToken,
}

impl RunGuard<'_> {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.engine.lock_run_cancel() = None;
        self.engine.run_active.store(false, Ordering::SeqCst);
    }
}

pub struct RelationDiscoveryEngine {
    graph: Arc<dyn GraphStore>,
    manager: Arc<CandidateManager>,
    processor: Arc<HeuristicsProcessor>,
    orchestrator: EvaluationOrchestrator,
    stats: Arc<PropertyStatsCache>,
    max_concurrent_processing: usize,
    run_active: AtomicBool,
    run_cancel: Mutex<Option<CancellationToken>>,
    scheduler: tokio::sync::Mutex<Option<SchedulerHandle>>,
}

impl RelationDiscoveryEngine {
    /// Wire the engine from its collaborators. `db` must already be migrated.
    pub fn new(config: &Config, db: Db, graph: Arc<dyn GraphStore>, oracle: Arc<dyn ConfidenceOracle>) -> Self {
        let manager = Arc::new(CandidateManager::new(
            db,
            graph.clone(),
            config.heuristics.example_match_limit,
        ));
        let processor = Arc::new(HeuristicsProcessor::new(
            graph.clone(),
            manager.clone(),
            config.heuristics.max_search_results,
        ));
        let stats = Arc::new(PropertyStatsCache::new(
            graph.clone(),
            config.evaluation.stats_cache_capacity,
        ));
        let contexts = ContextBuilder::new(
            manager.clone(),
            graph.clone(),
            stats.clone(),
            config.evaluation.sibling_limit,
            config.evaluation.example_value_limit,
        );
        let orchestrator = EvaluationOrchestrator::new(
            manager.clone(),
            oracle,
            contexts,
            EvaluationPolicy::from_config(&config.evaluation),
            config.evaluation.max_concurrent_evaluation,
        );

        Self {
            graph,
            manager,
            processor,
            orchestrator,
            stats,
            max_concurrent_processing: config.heuristics.max_concurrent_processing,
            run_active: AtomicBool::new(false),
            run_cancel: Mutex::new(None),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    /// Build the engine on the SQLite graph store and the configured oracle.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Db::new(config.db_path());
        let graph: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::new(Db::new(config.graph_db_path())));
        let oracle = oracle::from_config(&config.oracle)?;
        info!("Confidence oracle: {}", oracle.name());
        Ok(Self::new(config, db, graph, oracle))
    }

    pub fn manager(&self) -> &Arc<CandidateManager> {
        &self.manager
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn is_run_active(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    fn lock_run_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.run_cancel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin_run(&self) -> Result<RunGuard<'_>> {
        if self
            .run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReldiscoError::RunInProgress);
        }
        let cancel = CancellationToken::new();
        *self.lock_run_cancel() = Some(cancel.clone());
        Ok(RunGuard { engine: self, cancel })
    }

    /// Ask the active bulk operation to stop. Returns false when none is running.
    pub fn cancel_run(&self) -> bool {
        match self.lock_run_cancel().as_ref() {
            Some(token) => {
                info!("Cancelling active run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // Single-candidate operations

    pub async fn accept(&self, relation_id: &str) -> Result<()> {
        self.manager.apply_relation(OPERATOR_ACTOR, relation_id, true).await
    }

    pub async fn reject(&self, relation_id: &str) -> Result<()> {
        self.manager.unapply_relation(relation_id, true).await
    }

    pub async fn unreject(&self, relation_id: &str) -> Result<()> {
        self.manager.unreject(OPERATOR_ACTOR, relation_id).await
    }

    pub async fn evaluate(&self, relation_id: &str, force: bool) -> Result<EvaluationOutcome> {
        self.orchestrator.evaluate(relation_id, force).await
    }

    pub async fn sync(&self, relation_id: &str) -> Result<SyncOutcome> {
        self.manager.sync_relation(OPERATOR_ACTOR, relation_id).await
    }

    pub async fn candidate(&self, relation_id: &str) -> Result<Option<RelationCandidate>> {
        self.manager.fetch_candidate(relation_id).await
    }

    /// Every candidate, best deep-match quality first.
    pub async fn candidates(&self) -> Result<Vec<RelationCandidate>> {
        let mut all: Vec<_> = self.manager.fetch_all_candidates().await?.into_values().collect();
        all.sort_by(|a, b| {
            b.heuristic
                .deep_match_quality
                .total_cmp(&a.heuristic.deep_match_quality)
                .then_with(|| a.relation_id.cmp(&b.relation_id))
        });
        Ok(all)
    }

    pub async fn operations(&self, relation_id: &str, limit: usize) -> Result<Vec<OperationRecord>> {
        audit::recent_operations(self.manager.db(), relation_id, limit).await
    }

    pub async fn get_heuristics_version(&self) -> Result<Option<HeuristicsVersion>> {
        self.manager.current_heuristics_version().await
    }

    // Bulk operations

    /// Run one heuristics pass under a fresh version.
    pub async fn process_all(&self) -> Result<ProcessRunSummary> {
        let guard = self.begin_run()?;
        let (_, summary) = self.heuristics_pass(guard.token()).await?;
        Ok(summary)
    }

    pub async fn evaluate_all(&self, force: bool) -> Result<EvaluationRunSummary> {
        let guard = self.begin_run()?;
        self.orchestrator.evaluate_all(force, guard.token()).await
    }

    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        let _guard = self.begin_run()?;
        self.manager.cleanup().await
    }

    pub async fn process_and_evaluate_all(&self) -> Result<FullRunSummary> {
        self.run_full(FullRunOptions::default()).await
    }

    /// Heuristics pass, then cleanup, evaluation and a reconciling sync.
    pub async fn run_full(&self, options: FullRunOptions) -> Result<FullRunSummary> {
        let guard = self.begin_run()?;
        self.run_full_guarded(options, guard.token(), OPERATOR_ACTOR).await
    }

    async fn run_full_guarded(
        &self,
        options: FullRunOptions,
        cancel: &CancellationToken,
        actor: &str,
    ) -> Result<FullRunSummary> {
        let (version, heuristics) = self.heuristics_pass(cancel).await?;

        let cleanup = if options.cleanup {
            Some(self.manager.cleanup().await?)
        } else {
            None
        };

        let evaluation = if options.evaluate {
            if cancel.is_cancelled() {
                return Err(ReldiscoError::Cancelled);
            }
            Some(self.orchestrator.evaluate_all(options.force, cancel).await?)
        } else {
            None
        };

        let sync = self.manager.sync_pending(actor).await?;

        info!("Full run {} complete", version);
        Ok(FullRunSummary {
            version,
            heuristics,
            cleanup,
            evaluation,
            sync,
        })
    }

    async fn heuristics_pass(&self, cancel: &CancellationToken) -> Result<(HeuristicsVersion, ProcessRunSummary)> {
        let version = self.manager.begin_heuristics_run().await?;
        let summary = heuristics::run_pass(
            self.processor.clone(),
            self.graph.clone(),
            &version,
            self.max_concurrent_processing,
            cancel,
        )
        .await?;
        self.manager.complete_heuristics_run(&version).await?;
        // Coverage changes with the data just scanned.
        self.stats.clear();
        Ok((version, summary))
    }

    // Scheduler

    /// Start a background loop running a full pass every `interval`.
    ///
    /// The first pass starts immediately. A tick that finds another bulk
    /// operation active is skipped.
    pub async fn start(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Err(ReldiscoError::InvalidInput("scheduler already running".to_string()));
        }

        let (shutdown, mut shutdown_rx) = mpsc::channel::<()>(1);
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => engine.scheduled_run().await,
                }
            }
            info!("Scheduler stopped");
        });

        info!("Scheduler started (every {}s)", interval.as_secs());
        *slot = Some(SchedulerHandle { shutdown, task });
        Ok(())
    }

    /// Stop the scheduler, cancelling a pass it may be running.
    pub async fn stop(&self) {
        let Some(handle) = self.scheduler.lock().await.take() else {
            return;
        };
        let _ = handle.shutdown.send(()).await;
        self.cancel_run();
        if let Err(e) = handle.task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }

    pub async fn is_scheduler_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    async fn scheduled_run(&self) {
        let guard = match self.begin_run() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Scheduled run skipped: another run is active");
                return;
            }
        };
        match self
            .run_full_guarded(FullRunOptions::default(), guard.token(), SCHEDULER_ACTOR)
            .await
        {
            Ok(summary) => debug!("Scheduled run {} finished", summary.version),
            Err(ReldiscoError::Cancelled) => info!("Scheduled run cancelled"),
            Err(e) => warn!("Scheduled run failed: {}", e),
        }
    }
}
