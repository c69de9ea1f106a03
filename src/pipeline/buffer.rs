//! In-memory, shard-keyed accumulation of validated indicators
//!
//! `add` appends under the write lock in O(1) amortized time and never
//! touches storage. `drain_all` swaps every shard's vector out under the
//! same lock: O(shard count), not O(item count). Shards are created on
//! first insert and only ever emptied, never removed.

use super::error::RoutingError;
use super::indicator::Indicator;
use super::routing::{TableId, TableRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// What `add` did with an indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Buffered(TableId),
    /// Reserved shard (loopback / unspecified); silently dropped
    Reserved,
    /// No registered table for the value; dropped and logged
    Unroutable(RoutingError),
}

/// One drain's worth of pending indicators, keyed by destination table
pub type DrainedShards = HashMap<TableId, Vec<Indicator>>;

pub struct IngestionBuffer {
    registry: Arc<TableRegistry>,
    shards: RwLock<HashMap<TableId, Vec<Indicator>>>,
}

impl IngestionBuffer {
    pub fn new(registry: Arc<TableRegistry>) -> Self {
        Self {
            registry,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Append a validated indicator to its shard
    pub fn add(&self, indicator: Indicator) -> Admission {
        if indicator.is_reserved() {
            return Admission::Reserved;
        }

        let table = match self.registry.route_indicator(&indicator) {
            Ok(table) => table,
            Err(e) => {
                log::warn!("⚠️  Dropping unroutable {} '{}': {}", indicator.kind(), indicator.value(), e);
                return Admission::Unroutable(e);
            }
        };

        self.write()
            .entry(table.clone())
            .or_default()
            .push(indicator);
        Admission::Buffered(table)
    }

    /// Take ownership of every shard's contents, leaving each shard empty.
    ///
    /// Must not race itself; the scheduler is its only caller. An `add`
    /// that lands after this returns belongs to the next cycle.
    pub fn drain_all(&self) -> DrainedShards {
        let mut shards = self.write();
        shards
            .iter_mut()
            .filter(|(_, pending)| !pending.is_empty())
            .map(|(table, pending)| (table.clone(), std::mem::take(pending)))
            .collect()
    }

    /// Pending items per shard table (empty shards included)
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.read()
            .iter()
            .map(|(table, pending)| (table.name().to_string(), pending.len()))
            .collect()
    }

    /// Raw export of buffered values per shard table, for display
    pub fn values(&self) -> BTreeMap<String, Vec<String>> {
        self.read()
            .iter()
            .filter(|(_, pending)| !pending.is_empty())
            .map(|(table, pending)| {
                (
                    table.name().to_string(),
                    pending.iter().map(|i| i.value().to_string()).collect(),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TableId, Vec<Indicator>>> {
        self.shards.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TableId, Vec<Indicator>>> {
        self.shards.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::indicator::IndicatorKind;

    fn ip(value: &str) -> Indicator {
        Indicator::new(IndicatorKind::Ip4, value).unwrap()
    }

    fn buffer() -> IngestionBuffer {
        IngestionBuffer::new(Arc::new(TableRegistry::default()))
    }

    #[test]
    fn test_add_routes_by_first_character() {
        let buffer = buffer();
        assert!(matches!(buffer.add(ip("8.8.8.8")), Admission::Buffered(t) if t.name() == "ip4_8"));
        buffer.add(ip("8.8.4.4"));
        buffer.add(ip("9.9.9.9"));

        let counts = buffer.counts();
        assert_eq!(counts.get("ip4_8"), Some(&2));
        assert_eq!(counts.get("ip4_9"), Some(&1));
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_reserved_addresses_have_no_effect() {
        let buffer = buffer();
        assert_eq!(buffer.add(ip("127.0.0.1")), Admission::Reserved);
        assert_eq!(buffer.add(ip("0.0.0.0")), Admission::Reserved);
        assert_eq!(buffer.add(ip("0::1")), Admission::Reserved);
        assert!(buffer.is_empty());
        assert!(buffer.counts().is_empty());
    }

    #[test]
    fn test_duplicates_are_kept_in_buffer() {
        let buffer = buffer();
        buffer.add(ip("1.1.1.1"));
        buffer.add(ip("1.1.1.1"));
        assert_eq!(buffer.values().get("ip4_1").unwrap().len(), 2);
    }

    #[test]
    fn test_drain_empties_but_keeps_shards() {
        let buffer = buffer();
        buffer.add(ip("8.8.8.8"));
        buffer.add(ip("1.1.1.1"));

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained.values().map(Vec::len).sum::<usize>(), 2);

        // Shards survive, emptied
        assert_eq!(buffer.counts().get("ip4_8"), Some(&0));
        assert!(buffer.is_empty());

        // Later adds belong to the next cycle only
        buffer.add(ip("8.8.4.4"));
        let next = buffer.drain_all();
        assert_eq!(next.len(), 1);
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn test_hash_kinds_buffer_too() {
        let buffer = buffer();
        let md5 = Indicator::new(IndicatorKind::Md5, "d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert!(matches!(buffer.add(md5), Admission::Buffered(t) if t.name() == "md5_d"));
    }

    #[test]
    fn test_concurrent_adds() {
        let buffer = buffer();
        std::thread::scope(|scope| {
            for worker in 1..=4 {
                let buffer = &buffer;
                scope.spawn(move || {
                    for i in 0..250 {
                        buffer.add(ip(&format!("{}.0.{}.{}", worker, i / 250, i % 250)));
                    }
                });
            }
        });
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.drain_all().len(), 4);
    }
}
