//! Periodic flush of the ingestion buffer into sharded storage
//!
//! Each tick:
//! 1. ping the store, reconnecting in-line on failure
//! 2. drain every shard and count the drain
//! 3. split each shard into batches of at most `batch_size` values
//! 4. insert every batch as its own task in a `JoinSet`
//! 5. wait for all batches; one failure never aborts its siblings
//! 6. spawn counter persistence without waiting for it
//!
//! Drained values whose batch fails are not returned to the buffer. They
//! are counted as `dropped` in the tick's `FlushReport`.

use super::buffer::IngestionBuffer;
use super::error::StoreError;
use super::indicator::{Indicator, IndicatorKind};
use super::known::KnownValues;
use super::stats::{PersistOutcome, StatsAggregator};
use super::store::IndicatorStore;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Largest batch a single insert statement carries
pub const MAX_BATCH_SIZE: usize = 500;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(20);

/// Outcome of one flush tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Non-empty shards drained
    pub shards: usize,
    pub batches: usize,
    /// Values handed to the store
    pub attempted: usize,
    /// Rows newly written (conflicting duplicates excluded)
    pub inserted: usize,
    pub failed_batches: usize,
    /// Drained values lost to failed batches
    pub dropped: usize,
    pub duration_ms: u64,
    pub reconnected: bool,
    pub finished_at: i64,
}

/// Split `items` into consecutive batches of at most `size` (clamped to 1..=500)
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.clamp(1, MAX_BATCH_SIZE);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(size).collect());
    }
    batches
}

type PersistHandle = JoinHandle<Result<PersistOutcome, StoreError>>;

pub struct FlushScheduler {
    buffer: Arc<IngestionBuffer>,
    stats: Arc<StatsAggregator>,
    known: Arc<KnownValues>,
    store: Arc<dyn IndicatorStore>,
    last_flush: Arc<RwLock<Option<FlushReport>>>,
    interval: Duration,
    batch_size: usize,
    pending_persist: Option<PersistHandle>,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<IngestionBuffer>,
        stats: Arc<StatsAggregator>,
        known: Arc<KnownValues>,
        store: Arc<dyn IndicatorStore>,
    ) -> Self {
        Self {
            buffer,
            stats,
            known,
            store,
            last_flush: Arc::new(RwLock::new(None)),
            interval: DEFAULT_FLUSH_INTERVAL,
            batch_size: MAX_BATCH_SIZE,
            pending_persist: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Share the slot the latest report is published to
    pub fn with_report_slot(mut self, slot: Arc<RwLock<Option<FlushReport>>>) -> Self {
        self.last_flush = slot;
        self
    }

    pub fn last_flush(&self) -> Arc<RwLock<Option<FlushReport>>> {
        self.last_flush.clone()
    }

    /// Run ticks until `shutdown` resolves.
    ///
    /// A tick in progress when shutdown fires is abandoned: its `JoinSet`
    /// is dropped, aborting outstanding batch inserts.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        log::info!(
            "⏰ Starting flush scheduler (interval: {:?}, batch size: {})",
            self.interval,
            self.batch_size
        );

        tokio::pin!(shutdown);
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = timer.tick() => {}
            }

            tokio::select! {
                _ = &mut shutdown => {
                    log::warn!("🛑 Shutdown during flush; abandoning in-flight batches");
                    break;
                }
                _ = self.tick() => {}
            }
        }

        self.abort_persist();
        log::info!("🛑 Flush scheduler stopped");
    }

    /// One full cycle: harvest the previous persist, flush, publish, persist
    pub async fn tick(&mut self) -> FlushReport {
        self.harvest_persist().await;

        let report = self.flush_once().await;
        if report.attempted > 0 || report.failed_batches > 0 {
            log::info!(
                "📦 Flushed {} values in {} batches across {} shards: {} new rows, {} failed batches, {} dropped ({}ms)",
                report.attempted,
                report.batches,
                report.shards,
                report.inserted,
                report.failed_batches,
                report.dropped,
                report.duration_ms
            );
        } else {
            log::debug!("📦 Flush tick: buffer empty");
        }
        *self.last_flush.write().await = Some(report.clone());

        self.spawn_persist();
        report
    }

    /// Drain, chunk and insert; does not touch counter persistence
    pub async fn flush_once(&self) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport::default();

        if let Err(e) = self.store.ping().await {
            log::warn!("⚠️  Store health check failed ({}); reconnecting", e);
            match self.store.reconnect().await {
                Ok(()) => {
                    report.reconnected = true;
                    log::info!("🔌 Store connection re-established");
                }
                Err(e) => {
                    log::error!("❌ Reconnect failed, continuing degraded: {}", e);
                }
            }
        }

        let drained = self.buffer.drain_all();
        let drained_items: usize = drained.values().map(Vec::len).sum();
        self.stats.increment("flush_calls").await;
        self.stats.add("flushed_items", drained_items as i64).await;

        let mut tasks = JoinSet::new();
        for (table, indicators) in drained {
            report.shards += 1;
            for batch in chunk(indicators, self.batch_size) {
                report.batches += 1;
                report.attempted += batch.len();

                let store = self.store.clone();
                let table = table.clone();
                tasks.spawn(async move {
                    let values = batch.iter().map(|i| i.value().to_string()).collect();
                    let result = store.bulk_insert(&table, values).await;
                    (table, batch, result)
                });
            }
        }

        let mut settled = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((table, batch, Ok(written))) => {
                    settled += batch.len();
                    report.inserted += written;
                    self.remember(batch, table.width());
                }
                Ok((table, batch, Err(e))) => {
                    report.failed_batches += 1;
                    log::error!("❌ Batch of {} values into {} failed: {}", batch.len(), table, e);
                }
                Err(e) => {
                    report.failed_batches += 1;
                    log::error!("❌ Batch insert task failed: {}", e);
                }
            }
        }
        report.dropped = report.attempted - settled;

        if report.inserted > 0 {
            self.stats.add("inserted_rows", report.inserted as i64).await;
        }
        if report.failed_batches > 0 {
            self.stats.add("flush_failures", report.failed_batches as i64).await;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.finished_at = chrono::Utc::now().timestamp();

        self.stats.record_runtime_sample("buffered_items", drained_items as i64);
        self.stats.record_runtime_sample("flushed_items", settled as i64);
        self.stats.record_runtime_sample("inserted_rows", report.inserted as i64);
        self.stats.record_runtime_sample("flush_ms", report.duration_ms as i64);

        report
    }

    /// Addresses from a stored batch join the known cache; over-width
    /// values were filtered by the store and are skipped here too
    fn remember(&self, batch: Vec<Indicator>, width: Option<usize>) {
        let stored = batch.into_iter().filter_map(|mut indicator| {
            let fits = width.map_or(true, |w| indicator.value().len() <= w);
            if indicator.kind() != IndicatorKind::Ip4 || !fits {
                return None;
            }
            indicator.mark_persisted();
            Some(indicator)
        });
        self.known.extend(stored);
    }

    fn spawn_persist(&mut self) {
        if self.pending_persist.is_some() {
            log::debug!("⏳ Previous counter persist still running; not stacking another");
            return;
        }
        let stats = self.stats.clone();
        let store = self.store.clone();
        self.pending_persist = Some(tokio::spawn(async move { stats.persist(store.as_ref()).await }));
    }

    async fn harvest_persist(&mut self) {
        let finished = self
            .pending_persist
            .as_ref()
            .is_some_and(JoinHandle::is_finished);
        if !finished {
            return;
        }
        let Some(handle) = self.pending_persist.take() else {
            return;
        };

        match handle.await {
            Ok(Ok(PersistOutcome::Saved { counters })) => {
                log::debug!("💾 Counter persist saved {} counters", counters)
            }
            Ok(Ok(outcome)) => log::debug!("💾 Counter persist skipped: {:?}", outcome),
            Ok(Err(e)) => log::error!("❌ Counter persist failed: {}", e),
            Err(e) => log::error!("❌ Counter persist task failed: {}", e),
        }
    }

    fn abort_persist(&mut self) {
        if let Some(handle) = self.pending_persist.take() {
            if !handle.is_finished() {
                log::warn!("🛑 Aborting in-flight counter persist");
            }
            handle.abort();
        }
    }
}

/// Resolves on ctrl-c, SIGTERM (unix) or when `stop` flips to true
pub async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("❌ Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("❌ Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let stopped = async {
        if stop.wait_for(|stop| *stop).await.is_err() {
            // Sender gone without asking to stop
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => log::info!("🛑 Received ctrl-c"),
        _ = terminate => log::info!("🛑 Received SIGTERM"),
        _ = stopped => log::info!("🛑 Stop requested"),
    }
}
