//! Recent health results, kept in memory
//!
//! Each target gets a fixed-capacity ring; once it is full the oldest
//! result is evicted. Nothing is persisted across restarts.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::trace;

use crate::health::HealthResult;

pub const DEFAULT_CAPACITY: usize = 100;

/// Shared handle to the per-target rings
#[derive(Debug, Clone)]
pub struct HealthHistory {
    capacity: usize,
    results: Arc<RwLock<BTreeMap<String, VecDeque<HealthResult>>>>,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            results: Arc::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(&self, result: HealthResult) {
        let mut results = self.results.write().await;
        let ring = results
            .entry(result.target.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if ring.len() == self.capacity {
            ring.pop_front();
        }
        trace!(db = %result.target, len = ring.len() + 1, "recorded health result");
        ring.push_back(result);
    }

    pub async fn latest(&self, target: &str) -> Option<HealthResult> {
        self.results
            .read()
            .await
            .get(target)
            .and_then(|ring| ring.back().cloned())
    }

    /// Most recent result of every target, ordered by target name
    pub async fn latest_all(&self) -> Vec<HealthResult> {
        self.results
            .read()
            .await
            .values()
            .filter_map(|ring| ring.back().cloned())
            .collect()
    }

    /// Up to `limit` results for `target`, newest first
    pub async fn recent(&self, target: &str, limit: usize) -> Vec<HealthResult> {
        self.results
            .read()
            .await
            .get(target)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, target: &str) -> usize {
        self.results.read().await.get(target).map_or(0, VecDeque::len)
    }
}

impl Default for HealthHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
