//! `Pipeline`: the facade the request layer talks to
//!
//! Owns one instance of every shared component (buffer, counters, known
//! cache, match registry, store handle, last flush report) and wires the
//! flush scheduler to the same state. Nothing here is process-global; two
//! pipelines in one process are fully independent.

use super::buffer::{Admission, IngestionBuffer};
use super::config::PipelineConfig;
use super::error::{ConnectionError, StoreError, ValidationError};
use super::indicator::{Indicator, IndicatorKind};
use super::known::KnownValues;
use super::matches::{MatchLookup, MatchRegistry, PatternMatcher};
use super::routing::TableRegistry;
use super::scheduler::{FlushReport, FlushScheduler};
use super::stats::{CounterSet, Sample, StatsAggregator};
use super::store::{IndicatorStore, MatchRecord, SqliteShardStore};
use super::supervisor::ConnectionSupervisor;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Answer to an address query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "indicator", rename_all = "snake_case")]
pub enum Sighting {
    /// Already stored
    Known(Indicator),
    /// Not stored yet; the value was queued for the next flush
    NotFound,
}

/// Whether a URL was observed before in the current counter epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Novelty {
    Novel,
    Seen { count: i64 },
}

pub struct Pipeline {
    registry: Arc<TableRegistry>,
    buffer: Arc<IngestionBuffer>,
    stats: Arc<StatsAggregator>,
    known: Arc<KnownValues>,
    matches: MatchRegistry,
    store: Arc<dyn IndicatorStore>,
    last_flush: Arc<RwLock<Option<FlushReport>>>,
}

impl Pipeline {
    pub fn new(registry: Arc<TableRegistry>, store: Arc<dyn IndicatorStore>) -> Self {
        Self {
            buffer: Arc::new(IngestionBuffer::new(registry.clone())),
            stats: Arc::new(StatsAggregator::new()),
            known: Arc::new(KnownValues::new()),
            matches: MatchRegistry::new(registry.clone(), store.clone()),
            registry,
            store,
            last_flush: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect to the configured SQLite file; exhausting retries is fatal
    pub async fn connect(config: &PipelineConfig) -> Result<Self, ConnectionError> {
        let supervisor = ConnectionSupervisor::connect(&config.db_path, config.retry_policy()).await?;
        log::info!("✅ Connected to {}", config.db_path);

        let store: Arc<dyn IndicatorStore> = Arc::new(SqliteShardStore::new(Arc::new(supervisor)));
        let registry = Arc::new(TableRegistry::new(&config.match_kinds));
        Ok(Self::new(registry, store))
    }

    /// Seed the known cache from every existing address shard
    pub async fn load_known(&self) -> Result<usize, StoreError> {
        let tables = self.registry.tables_for(IndicatorKind::Ip4.as_str());
        let loaded = self.store.load_indicators(IndicatorKind::Ip4, &tables).await?;
        let added = self.known.extend(loaded);
        log::info!("📥 Seeded known cache with {} addresses", added);
        Ok(added)
    }

    /// Flush scheduler sharing this pipeline's state
    pub fn scheduler(&self, config: &PipelineConfig) -> FlushScheduler {
        FlushScheduler::new(
            self.buffer.clone(),
            self.stats.clone(),
            self.known.clone(),
            self.store.clone(),
        )
        .with_interval(config.flush_interval())
        .with_batch_size(config.flush_batch_size)
        .with_report_slot(self.last_flush.clone())
    }

    /// Validate and buffer one value
    pub async fn ingest(&self, kind: &str, value: &str) -> Result<Admission, ValidationError> {
        let indicator = match IndicatorKind::parse(kind).and_then(|k| Indicator::new(k, value)) {
            Ok(indicator) => indicator,
            Err(e) => {
                self.stats.increment("rejected").await;
                log::debug!("Rejected {} '{}': {}", kind, value, e);
                return Err(e);
            }
        };

        self.stats.increment(&format!("{}_added", indicator.kind())).await;
        let admission = self.buffer.add(indicator);
        if admission == Admission::Reserved {
            self.stats.increment("reserved_dropped").await;
        }
        Ok(admission)
    }

    /// Validate every value first; one invalid value rejects the whole batch.
    ///
    /// Returns how many values were buffered (reserved ones are not).
    pub async fn ingest_bulk<S: AsRef<str>>(
        &self,
        kind: &str,
        values: &[S],
    ) -> Result<usize, ValidationError> {
        let validated: Result<Vec<Indicator>, ValidationError> = IndicatorKind::parse(kind)
            .and_then(|k| values.iter().map(|v| Indicator::new(k, v.as_ref())).collect());

        let indicators = match validated {
            Ok(indicators) => indicators,
            Err(e) => {
                self.stats.increment("rejected").await;
                log::debug!("Rejected bulk {} request of {} values: {}", kind, values.len(), e);
                return Err(e);
            }
        };

        let mut buffered = 0;
        let mut reserved = 0;
        for indicator in indicators {
            match self.buffer.add(indicator) {
                Admission::Buffered(_) => buffered += 1,
                Admission::Reserved => reserved += 1,
                Admission::Unroutable(_) => {}
            }
        }

        if let Ok(kind) = IndicatorKind::parse(kind) {
            self.stats.add(&format!("{}_added", kind), values.len() as i64).await;
        }
        if reserved > 0 {
            self.stats.add("reserved_dropped", reserved).await;
        }
        Ok(buffered)
    }

    /// Look an address up in the known cache; a miss queues it for storage
    pub async fn check_ip4(&self, value: &str) -> Result<Sighting, ValidationError> {
        self.stats.increment("ip4_queries").await;
        if let Some(found) = self.known.get(value) {
            return Ok(Sighting::Known(found));
        }

        let indicator = Indicator::new(IndicatorKind::Ip4, value)?;
        self.buffer.add(indicator);
        Ok(Sighting::NotFound)
    }

    /// Count a URL sighting; the first one in the counter epoch is novel
    pub async fn observe_url(&self, value: &str) -> Result<Novelty, ValidationError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ValidationError::InvalidValue {
                kind: "url",
                value: value.to_string(),
            });
        }

        match self.stats.increment(&format!("url:{}", value)).await {
            1 => Ok(Novelty::Novel),
            count => Ok(Novelty::Seen { count }),
        }
    }

    pub async fn find_or_record(&self, kind: &str, value: &str) -> Result<MatchLookup, StoreError> {
        let lookup = self.matches.find_or_record(kind, value).await?;
        let counter = if lookup.is_seen() { "match_hits" } else { "match_misses" };
        self.stats.increment(counter).await;
        Ok(lookup)
    }

    /// Run every pattern over `text` and return the matches already stored.
    ///
    /// Address matches are buffered like any ingested address. Other
    /// matches go through `find_or_record`; new ones are written in the
    /// background and not awaited.
    pub async fn scan_text(&self, text: &str, matcher: &dyn PatternMatcher) -> Vec<MatchRecord> {
        let mut known = Vec::new();

        for pattern in matcher.patterns() {
            let found: BTreeSet<String> = matcher.find(text, &pattern).into_iter().collect();
            if found.is_empty() {
                continue;
            }

            if IndicatorKind::parse(&pattern) == Ok(IndicatorKind::Ip4) {
                for value in &found {
                    if let Err(e) = self.ingest(IndicatorKind::Ip4.as_str(), value).await {
                        log::debug!("Skipping scanned address: {}", e);
                    }
                }
                continue;
            }

            if !self.registry.is_registered(&pattern) {
                log::debug!("No match tables for pattern '{}'; skipping {} matches", pattern, found.len());
                continue;
            }

            for value in &found {
                match self.find_or_record(&pattern, value).await {
                    Ok(MatchLookup::Seen(record)) => known.push(record),
                    Ok(MatchLookup::NotSeen { .. }) => {}
                    Err(e) => log::warn!("⚠️  Could not record {} match '{}': {}", pattern, value, e),
                }
            }
        }

        known
    }

    /// Pending items per shard table
    pub fn buffered_counts(&self) -> BTreeMap<String, usize> {
        self.buffer.counts()
    }

    pub fn buffered_values(&self) -> BTreeMap<String, Vec<String>> {
        self.buffer.values()
    }

    /// Known values in insertion order within `[start, end)`
    pub fn cached_values(&self, start: usize, end: usize) -> Vec<String> {
        self.known.page(start, end)
    }

    pub async fn stats_snapshot(&self) -> CounterSet {
        self.stats.snapshot().await
    }

    /// Counters as last written to the store
    pub async fn durable_counters(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.stats.load_durable(self.store.as_ref()).await
    }

    pub fn runtime_history(&self, name: &str) -> Vec<Sample> {
        self.stats.history(name)
    }

    pub async fn last_flush(&self) -> Option<FlushReport> {
        self.last_flush.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn IndicatorStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::matches::RegexMatcher;
    use crate::pipeline::test_support::open_sqlite_store;
    use tempfile::TempDir;

    async fn pipeline() -> (TempDir, Pipeline) {
        let (dir, store) = open_sqlite_store().await;
        let registry = Arc::new(TableRegistry::new(["url", "email"]));
        (dir, Pipeline::new(registry, store))
    }

    #[tokio::test]
    async fn test_ingest_counts_and_buffers() {
        let (_dir, pipeline) = pipeline().await;

        assert!(matches!(pipeline.ingest("ip4", "8.8.8.8").await, Ok(Admission::Buffered(_))));
        assert_eq!(pipeline.ingest("ip4", "127.0.0.1").await, Ok(Admission::Reserved));
        assert!(pipeline.ingest("ip4", "not-an-ip").await.is_err());
        assert!(pipeline.ingest("md5", "short").await.is_err());
        assert!(matches!(
            pipeline.ingest("crc32", "abcd").await,
            Err(ValidationError::UnknownKind(_))
        ));

        let stats = pipeline.stats_snapshot().await;
        assert_eq!(stats.get("ip4_added"), 2);
        assert_eq!(stats.get("reserved_dropped"), 1);
        assert_eq!(stats.get("rejected"), 3);
        assert_eq!(pipeline.buffered_counts().get("ip4_8"), Some(&1));
    }

    #[tokio::test]
    async fn test_ingest_bulk_is_all_or_nothing() {
        let (_dir, pipeline) = pipeline().await;

        let rejected = pipeline.ingest_bulk("ip4", &["1.1.1.1", "bogus", "2.2.2.2"]).await;
        assert!(rejected.is_err());
        assert!(pipeline.buffered_values().is_empty());

        let buffered = pipeline
            .ingest_bulk("ip4", &["1.1.1.1", "0.0.0.0", "2.2.2.2"])
            .await
            .unwrap();
        assert_eq!(buffered, 2);
        assert_eq!(pipeline.stats_snapshot().await.get("ip4_added"), 3);
    }

    #[tokio::test]
    async fn test_check_ip4_queues_then_finds() {
        let (_dir, pipeline) = pipeline().await;
        let config = PipelineConfig::default();
        let mut scheduler = pipeline.scheduler(&config);

        assert_eq!(pipeline.check_ip4("5.6.7.8").await.unwrap(), Sighting::NotFound);
        assert_eq!(pipeline.buffered_counts().get("ip4_5"), Some(&1));

        scheduler.tick().await;
        assert!(matches!(pipeline.check_ip4("5.6.7.8").await, Ok(Sighting::Known(_))));
        assert_eq!(pipeline.cached_values(0, 10), vec!["5.6.7.8"]);
        assert_eq!(pipeline.last_flush().await.unwrap().inserted, 1);
    }

    #[tokio::test]
    async fn test_load_known_from_store() {
        let (_dir, pipeline) = pipeline().await;
        pipeline.ingest_bulk("ip4", &["3.3.3.3", "4.4.4.4"]).await.unwrap();
        pipeline.scheduler(&PipelineConfig::default()).flush_once().await;

        // A fresh pipeline over the same store sees what was flushed
        let fresh = Pipeline::new(pipeline.registry().clone(), pipeline.store().clone());
        assert_eq!(fresh.load_known().await.unwrap(), 2);
        assert!(matches!(fresh.check_ip4("4.4.4.4").await, Ok(Sighting::Known(_))));
    }

    #[tokio::test]
    async fn test_observe_url_novelty() {
        let (_dir, pipeline) = pipeline().await;
        assert_eq!(pipeline.observe_url("https://a.example").await, Ok(Novelty::Novel));
        assert_eq!(
            pipeline.observe_url("https://a.example").await,
            Ok(Novelty::Seen { count: 2 })
        );
        assert!(pipeline.observe_url("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_text_records_and_reports_known() {
        let (_dir, pipeline) = pipeline().await;
        let matcher = RegexMatcher::with_defaults().unwrap();
        let text = "mail bob@example.com about 9.9.9.9 and bob@example.com";

        assert!(pipeline.scan_text(text, &matcher).await.is_empty());
        assert_eq!(pipeline.buffered_counts().get("ip4_9"), Some(&1));

        // Give the background insert time to land
        let mut known = Vec::new();
        for _ in 0..50 {
            known = pipeline.scan_text("bob@example.com", &matcher).await;
            if !known.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].kind, "email");
        assert!(pipeline.stats_snapshot().await.get("match_hits") >= 1);
    }
}
