//! Process-wide event counters with lazy upsert persistence
//!
//! Counters sit behind one async `RwLock`, independent of the ingestion
//! buffer's lock. `persist` holds the write lock from snapshot through save
//! to reset, so an increment either lands before the save (and is written)
//! or after the reset (and starts the next epoch at zero).
//!
//! A small allow-list of counters also keeps a bounded in-memory time
//! series for introspection; that path never touches storage.

use super::error::StoreError;
use super::store::IndicatorStore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::RwLock;

/// Series that `record_runtime_sample` accepts
pub const RUNTIME_SERIES: [&str; 4] = ["buffered_items", "flushed_items", "inserted_rows", "flush_ms"];

/// Samples kept per series before the oldest is evicted
pub const HISTORY_CAPACITY: usize = 120;

/// Counter map plus the "already durably saved" sentinel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSet {
    counts: BTreeMap<String, i64>,
    saved: bool,
}

impl CounterSet {
    pub fn get(&self, name: &str) -> i64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &BTreeMap<String, i64> {
        &self.counts
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Sentinel already set; nothing written
    AlreadySaved,
    /// No counters to write
    Empty,
    Saved { counters: usize },
}

pub struct StatsAggregator {
    counters: RwLock<CounterSet>,
    history: Mutex<HashMap<&'static str, VecDeque<Sample>>>,
    history_capacity: usize,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            counters: RwLock::new(CounterSet::default()),
            history: Mutex::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Bump a counter, creating it at zero first; returns the new count
    pub async fn increment(&self, name: &str) -> i64 {
        self.add(name, 1).await
    }

    pub async fn add(&self, name: &str, delta: i64) -> i64 {
        let mut set = self.counters.write().await;
        let count = set.counts.entry(name.to_string()).or_insert(0);
        *count += delta;
        *count
    }

    pub async fn snapshot(&self) -> CounterSet {
        self.counters.read().await.clone()
    }

    /// Upsert every counter into the store, then start a fresh epoch.
    ///
    /// On a store error the in-memory counts are kept for the next attempt.
    pub async fn persist(&self, store: &dyn IndicatorStore) -> Result<PersistOutcome, StoreError> {
        let mut set = self.counters.write().await;
        if set.saved {
            return Ok(PersistOutcome::AlreadySaved);
        }
        if set.counts.is_empty() {
            return Ok(PersistOutcome::Empty);
        }

        let written = store.save_counters(&set.counts).await?;
        set.saved = true;
        log::debug!("💾 Persisted {} counters", written);

        *set = CounterSet::default();
        Ok(PersistOutcome::Saved { counters: written })
    }

    /// Durable counter values, for display
    pub async fn load_durable(
        &self,
        store: &dyn IndicatorStore,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        store.load_counters().await
    }

    /// Append to a bounded series; false if `name` is not allow-listed
    pub fn record_runtime_sample(&self, name: &str, value: i64) -> bool {
        let Some(series) = RUNTIME_SERIES.iter().copied().find(|s| *s == name) else {
            return false;
        };

        let sample = Sample {
            timestamp: chrono::Utc::now().timestamp(),
            value,
        };
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = history.entry(series).or_default();
        if ring.len() >= self.history_capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
        true
    }

    /// Samples of one series, oldest first
    pub fn history(&self, name: &str) -> Vec<Sample> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
