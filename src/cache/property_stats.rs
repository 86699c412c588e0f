use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::graph::{GraphStore, PropertyValueCount};

type StatsKey = (String, String);

/// LRU cache of property coverage statistics
///
/// Evaluation prompts for sibling candidates ask for the same
/// (entity type, property) statistics repeatedly; this keeps the graph store
/// from recounting them for every candidate. Cleared after each heuristics
/// run since the counts go stale as entities change.
pub struct PropertyStatsCache {
    graph: Arc<dyn GraphStore>,
    cache: Mutex<LruCache<StatsKey, PropertyValueCount>>,
}

impl PropertyStatsCache {
    /// Create a cache with room for `capacity` entries (minimum 1)
    pub fn new(graph: Arc<dyn GraphStore>, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            graph,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<StatsKey, PropertyValueCount>> {
        // Entries are plain values, so a poisoned cache is still consistent.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached `get_property_value_count`; misses go to the graph store.
    pub async fn get(&self, entity_type: &str, property: &str) -> Result<PropertyValueCount> {
        let key = (entity_type.to_string(), property.to_string());
        if let Some(stats) = self.lock().get(&key).copied() {
            log::debug!("Stats cache hit for {}.{}", entity_type, property);
            return Ok(stats);
        }

        let stats = self.graph.get_property_value_count(entity_type, property).await?;
        self.lock().put(key, stats);
        Ok(stats)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
