//! Free-text pattern matches: synchronous lookup, background record on miss
//!
//! `find_or_record` answers from a point lookup. On a miss it spawns the
//! insert and returns straight away with the task handle, so the caller can
//! await the write or drop the handle and move on. Concurrent first
//! sightings of one value race harmlessly: the insert ignores conflicts.

use super::error::StoreError;
use super::indicator::{Indicator, IndicatorKind};
use super::routing::{TableFamily, TableRegistry};
use super::store::{IndicatorStore, MatchRecord, Record};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Externally supplied matching capability: text + pattern name -> matches
pub trait PatternMatcher: Send + Sync {
    /// Names of every pattern this matcher knows
    fn patterns(&self) -> Vec<String>;

    /// Substrings of `text` matching `pattern`; empty for unknown patterns
    fn find(&self, text: &str, pattern: &str) -> Vec<String>;
}

/// Built-in expressions, keyed by the kind they record under
pub const DEFAULT_PATTERNS: [(&str, &str); 7] = [
    ("md5", r"\b[a-fA-F0-9]{32}\b"),
    ("sha1", r"\b[a-fA-F0-9]{40}\b"),
    ("sha256", r"\b[a-fA-F0-9]{64}\b"),
    ("sha512", r"\b[a-fA-F0-9]{128}\b"),
    ("ip4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
    ("url", r#"https?://[^\s"'<>]+"#),
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
];

/// `PatternMatcher` over a set of named regular expressions
#[derive(Debug, Clone, Default)]
pub struct RegexMatcher {
    expressions: BTreeMap<String, Regex>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self, regex::Error> {
        DEFAULT_PATTERNS
            .iter()
            .try_fold(Self::new(), |matcher, (name, expr)| matcher.with_pattern(name, expr))
    }

    pub fn with_pattern(mut self, name: &str, expr: &str) -> Result<Self, regex::Error> {
        self.expressions.insert(name.to_string(), Regex::new(expr)?);
        Ok(self)
    }
}

impl PatternMatcher for RegexMatcher {
    fn patterns(&self) -> Vec<String> {
        self.expressions.keys().cloned().collect()
    }

    fn find(&self, text: &str, pattern: &str) -> Vec<String> {
        self.expressions
            .get(pattern)
            .map(|re| re.find_iter(text).map(|m| m.as_str().to_string()).collect())
            .unwrap_or_default()
    }
}

/// Result of `find_or_record`
#[derive(Debug)]
pub enum MatchLookup {
    /// Already stored
    Seen(MatchRecord),
    /// Not stored yet; `pending` resolves to whether this call's insert wrote the row
    NotSeen {
        record: MatchRecord,
        pending: JoinHandle<Result<bool, StoreError>>,
    },
}

impl MatchLookup {
    pub fn is_seen(&self) -> bool {
        matches!(self, MatchLookup::Seen(_))
    }

    pub fn record(&self) -> &MatchRecord {
        match self {
            MatchLookup::Seen(record) => record,
            MatchLookup::NotSeen { record, .. } => record,
        }
    }
}

pub struct MatchRegistry {
    registry: Arc<TableRegistry>,
    store: Arc<dyn IndicatorStore>,
}

impl MatchRegistry {
    pub fn new(registry: Arc<TableRegistry>, store: Arc<dyn IndicatorStore>) -> Self {
        Self { registry, store }
    }

    pub async fn find_or_record(&self, kind: &str, value: &str) -> Result<MatchLookup, StoreError> {
        let table = self.registry.route(kind, value)?;
        if table.family() != TableFamily::Match {
            return Err(StoreError::FamilyMismatch {
                table: table.name().to_string(),
                expected: "match",
            });
        }
        // Hash kinds hold fixed-width hex; free-text kinds take any value
        if let Ok(kind) = IndicatorKind::parse(table.kind()) {
            Indicator::new(kind, value)?;
        }

        match self.store.lookup(&table, value).await {
            Ok(Some(Record::Match(found))) => {
                log::debug!("🔁 {} '{}' seen again (id {:?})", table.kind(), value, found.id);
                return Ok(MatchLookup::Seen(found));
            }
            Ok(Some(Record::Address(_))) => {
                return Err(StoreError::FamilyMismatch {
                    table: table.name().to_string(),
                    expected: "match",
                });
            }
            Ok(None) => {}
            Err(e) => {
                // A failed lookup is answered as a miss; the insert below
                // will surface the same fault if the store is really down.
                log::warn!("⚠️  Lookup in {} failed, treating as unseen: {}", table, e);
            }
        }

        let record = MatchRecord::new(table.kind(), value, chrono::Utc::now().timestamp());
        let store = self.store.clone();
        let to_write = record.clone();
        let pending = tokio::spawn(async move {
            let result = store.record_match(&table, &to_write).await;
            match &result {
                Ok(true) => log::debug!("✅ Recorded {} '{}' in {}", to_write.kind, to_write.value, table),
                Ok(false) => log::debug!("{} '{}' already recorded", to_write.kind, to_write.value),
                Err(e) => log::error!("❌ Failed to record {} '{}': {}", to_write.kind, to_write.value, e),
            }
            result
        });

        Ok(MatchLookup::NotSeen { record, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::RoutingError;
    use crate::pipeline::test_support::open_sqlite_store;

    async fn registry_with_store() -> (tempfile::TempDir, MatchRegistry, Arc<crate::pipeline::store::SqliteShardStore>) {
        let (dir, store) = open_sqlite_store().await;
        let tables = Arc::new(TableRegistry::new(["url", "email"]));
        let registry = MatchRegistry::new(tables, store.clone());
        (dir, registry, store)
    }

    #[tokio::test]
    async fn test_first_sighting_then_seen() {
        let (_dir, registry, _store) = registry_with_store().await;
        let hash = "d41d8cd98f00b204e9800998ecf8427e";

        let first = registry.find_or_record("md5", hash).await.unwrap();
        let created = first.record().created;
        let MatchLookup::NotSeen { pending, .. } = first else {
            panic!("empty store must report not seen");
        };
        assert!(pending.await.unwrap().unwrap());

        let second = registry.find_or_record("md5", hash).await.unwrap();
        assert!(second.is_seen());
        assert_eq!(second.record().created, created);
        assert_eq!(second.record().value, hash);
        assert!(second.record().id.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_first_sightings_store_one_row() {
        let (_dir, registry, store) = registry_with_store().await;
        let value = "https://example.com/payload";

        let mut pendings = Vec::new();
        for _ in 0..5 {
            if let MatchLookup::NotSeen { pending, .. } =
                registry.find_or_record("url", value).await.unwrap()
            {
                pendings.push(pending);
            }
        }
        let mut written = 0;
        for pending in pendings {
            if pending.await.unwrap().unwrap() {
                written += 1;
            }
        }
        assert!(written <= 1);

        let rows: i64 = store
            .supervisor()
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM \"url_h\"", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_routing_failures_surface() {
        let (_dir, registry, _store) = registry_with_store().await;
        assert!(matches!(
            registry.find_or_record("unknown", "value").await,
            Err(StoreError::Routing(RoutingError::UnknownKind(_)))
        ));
        assert!(matches!(
            registry.find_or_record("url", "").await,
            Err(StoreError::Routing(RoutingError::EmptyValue))
        ));
        assert!(matches!(
            registry.find_or_record("ip4", "8.8.8.8").await,
            Err(StoreError::FamilyMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_hash_is_never_recorded() {
        let (_dir, registry, store) = registry_with_store().await;
        for (kind, value) in [
            ("md5", "abc"),
            ("sha1", "d41d8cd98f00b204e9800998ecf8427e"),
            ("sha256", "not-a-hash"),
        ] {
            assert!(matches!(
                registry.find_or_record(kind, value).await,
                Err(StoreError::Invalid(_))
            ));
        }

        let tables: i64 = store
            .supervisor()
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('md5_a', 'sha1_d', 'sha256_n')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(tables, 0);

        // Free-text kinds keep accepting arbitrary values
        let url = registry.find_or_record("url", "abc").await.unwrap();
        assert!(!url.is_seen());
    }

    #[test]
    fn test_regex_matcher_defaults() {
        let matcher = RegexMatcher::with_defaults().unwrap();
        let text = "beacon to https://evil.example/x from 10.1.2.3, sample d41d8cd98f00b204e9800998ecf8427e";

        assert_eq!(matcher.find(text, "url"), vec!["https://evil.example/x"]);
        assert_eq!(matcher.find(text, "ip4"), vec!["10.1.2.3"]);
        assert_eq!(matcher.find(text, "md5"), vec!["d41d8cd98f00b204e9800998ecf8427e"]);
        assert!(matcher.find(text, "sha1").is_empty());
        assert!(matcher.find(text, "nope").is_empty());
        assert!(matcher.patterns().contains(&"email".to_string()));
    }
}
