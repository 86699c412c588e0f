//! Heuristics pass: proposes relation candidates from value overlap.
//!
//! [`HeuristicsProcessor::process`] handles one entity. [`run_pass`] feeds
//! every entity of every type through a bounded pool of those tasks.

mod processor;

pub use processor::{EntityOutcome, HeuristicsProcessor};

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use log::{info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::candidates::HeuristicsVersion;
use crate::entity::Entity;
use crate::error::{Result, ReldiscoError};
use crate::graph::{GraphStore, PropertyFilter};

/// Totals for one heuristics pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessRunSummary {
    pub entity_types: usize,
    pub entities: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub observations: usize,
}

enum TaskResult {
    Outcome(EntityOutcome),
    Failed,
}

/// Process every entity in the graph store under `version`.
///
/// Entities are fetched one type at a time and handed to at most
/// `max_concurrent` concurrent tasks. Only one type's entities are held in
/// memory at once. Per-entity failures are counted and
/// logged; errors classified fatal, and cancellation, abort the pass.
pub async fn run_pass(
    processor: Arc<HeuristicsProcessor>,
    graph: Arc<dyn GraphStore>,
    version: &HeuristicsVersion,
    max_concurrent: usize,
    cancel: &CancellationToken,
) -> Result<ProcessRunSummary> {
    let types = graph.get_all_entity_types().await?;
    let mut summary = ProcessRunSummary {
        entity_types: types.len(),
        ..ProcessRunSummary::default()
    };
    info!("Heuristics pass {} over {} entity type(s)", version, types.len());

    let filter = PropertyFilter::new();
    let entities = stream::iter(types)
        .then(|entity_type| {
            let graph = graph.clone();
            let filter = filter.clone();
            async move { graph.find_entity(&entity_type, &filter).await }.boxed()
        })
        .flat_map(|batch| match batch {
            Ok(entities) => stream::iter(entities.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
        .boxed();

    let mut results = std::pin::pin!(entities
        .map(|entity: Result<Entity>| {
            let processor = processor.clone();
            let version = version.clone();
            let cancel = cancel.clone();
            async move {
                let entity = entity?;
                if cancel.is_cancelled() {
                    return Err(ReldiscoError::Cancelled);
                }
                match processor.process(&version, &entity).await {
                    Ok(outcome) => Ok(TaskResult::Outcome(outcome)),
                    Err(e) if e.is_fatal_for_run() => Err(e),
                    Err(e) => {
                        warn!("Failed to process {} entity: {}", entity.entity_type, e);
                        Ok(TaskResult::Failed)
                    }
                }
            }
            .boxed()
        })
        .buffer_unordered(max_concurrent.max(1)));

    while let Some(result) = results.next().await {
        summary.entities += 1;
        match result? {
            TaskResult::Outcome(EntityOutcome::Skipped) => summary.skipped += 1,
            TaskResult::Outcome(EntityOutcome::Observed(n)) => {
                summary.processed += 1;
                summary.observations += n;
            }
            TaskResult::Failed => summary.failed += 1,
        }
    }

    info!(
        "Heuristics pass {}: {} entities, {} processed, {} skipped, {} failed, {} observations",
        version, summary.entities, summary.processed, summary.skipped, summary.failed, summary.observations
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateManager;
    use crate::graph::MemoryGraphStore;
    use crate::testing::temp_db;

    fn entities() -> Vec<Entity> {
        let mut entities = vec![Entity::new("Pod").with_property("node_name", "worker-1")];
        for i in 0..12 {
            entities.push(
                Entity::new("Pod")
                    .with_primary_key(["name"])
                    .with_property("name", format!("api-{}", i))
                    .with_property("node_name", format!("worker-{}", i % 3)),
            );
        }
        for i in 0..3 {
            entities.push(
                Entity::new("Node")
                    .with_primary_key(["name"])
                    .with_property("name", format!("worker-{}", i)),
            );
        }
        entities
    }

    async fn setup() -> (Arc<HeuristicsProcessor>, Arc<CandidateManager>, Arc<dyn GraphStore>, tempfile::TempDir) {
        let (db, temp) = temp_db().await;
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::with_entities(entities()));
        let manager = Arc::new(CandidateManager::new(db, graph.clone(), 5));
        let processor = Arc::new(HeuristicsProcessor::new(graph.clone(), manager.clone(), 50));
        (processor, manager, graph, temp)
    }

    #[tokio::test]
    async fn test_pass_counts_every_pair() {
        let (processor, manager, graph, _temp) = setup().await;
        let version = manager.begin_heuristics_run().await.unwrap();

        let summary = run_pass(processor, graph, &version, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.entity_types, 2);
        assert_eq!(summary.entities, 16);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);

        let all = manager.fetch_all_candidates().await.unwrap();
        assert_eq!(all.len(), 1);
        let candidate = all.values().next().unwrap();
        assert_eq!(candidate.heuristic.count, 12);
        assert_eq!(candidate.heuristic.example_matches.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pass_runs_on_spawned_task() {
        let (processor, manager, graph, _temp) = setup().await;
        let version = manager.begin_heuristics_run().await.unwrap();

        let summary = tokio::spawn(async move {
            run_pass(processor, graph, &version, 4, &CancellationToken::new()).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(summary.entities, 16);
        assert_eq!(summary.failed, 0);
        assert_eq!(manager.fetch_all_candidates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops() {
        let (processor, manager, graph, _temp) = setup().await;
        let version = manager.begin_heuristics_run().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_pass(processor, graph, &version, 4, &cancel).await.unwrap_err();
        assert!(matches!(err, ReldiscoError::Cancelled));
        assert!(manager.fetch_all_candidates().await.unwrap().is_empty());
    }
}
