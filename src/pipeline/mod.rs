//! # Sharded indicator ingestion pipeline
//!
//! Short textual indicators (IPv4 addresses, content hashes, free-text
//! pattern matches) are validated at the boundary, buffered in memory by
//! shard, and flushed periodically into SQLite tables partitioned by the
//! first character of each value.
//!
//! ## Data flow
//!
//! ```text
//! request layer ──► Pipeline::ingest ──► IngestionBuffer (per-shard Vec)
//!                                              │ tick
//!                                              ▼
//!                        FlushScheduler: drain ─► chunk(≤500) ─► JoinSet
//!                                              │
//!                                              ▼
//!                              IndicatorStore::bulk_insert (ON CONFLICT DO NOTHING)
//!
//! request layer ──► Pipeline::find_or_record ──► MatchRegistry ──► lookup / spawned insert
//! ```
//!
//! Counters live in `StatsAggregator` and are upserted into the `access`
//! table after each tick, in a background task the scheduler tracks.
//!
//! ## Module Organization
//!
//! - `config` - Environment-driven runtime settings
//! - `error` - Validation, routing, store and connection errors
//! - `indicator` - Indicator kinds and validity predicates
//! - `routing` - Pre-registered (kind, shard) table identifiers
//! - `supervisor` - Connection establishment, health check, reconnect
//! - `store` - `IndicatorStore` trait and the SQLite implementation
//! - `buffer` - Shard-keyed in-memory buffer
//! - `known` - Cache of values known to be stored
//! - `stats` - Counters, persistence and runtime history
//! - `matches` - Pattern matching and find-or-record
//! - `scheduler` - Periodic flush loop and shutdown signal
//! - `service` - `Pipeline` facade

pub mod buffer;
pub mod config;
pub mod error;
pub mod indicator;
pub mod known;
pub mod matches;
pub mod routing;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod store;
pub mod supervisor;

// Re-export commonly used types
pub use buffer::{Admission, IngestionBuffer};
pub use config::PipelineConfig;
pub use error::{ConnectionError, RoutingError, StoreError, ValidationError};
pub use indicator::{Indicator, IndicatorKind};
pub use known::KnownValues;
pub use matches::{MatchLookup, MatchRegistry, PatternMatcher, RegexMatcher};
pub use routing::{TableFamily, TableId, TableRegistry};
pub use scheduler::{shutdown_signal, FlushReport, FlushScheduler};
pub use service::{Novelty, Pipeline, Sighting};
pub use stats::{CounterSet, PersistOutcome, Sample, StatsAggregator};
pub use store::{IndicatorStore, MatchRecord, Record, SqliteShardStore};
pub use supervisor::{ConnectionSupervisor, RetryPolicy};

#[cfg(test)]
pub(crate) mod test_support {
    use super::store::SqliteShardStore;
    use super::supervisor::{ConnectionSupervisor, RetryPolicy};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fresh SQLite store in a temp dir; keep the `TempDir` alive for the test
    pub(crate) async fn open_sqlite_store() -> (TempDir, Arc<SqliteShardStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pipeline.db");
        let supervisor = ConnectionSupervisor::connect(
            db_path.to_str().unwrap(),
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .await
        .unwrap();
        (dir, Arc::new(SqliteShardStore::new(Arc::new(supervisor))))
    }
}
