//! Sharded storage: table provisioning, deduplicating batch inserts, lookups
//!
//! ## Schemas
//!
//! - Address family (`ip4_<token>`):
//!   `id INTEGER PRIMARY KEY AUTOINCREMENT, value VARCHAR(15) UNIQUE NOT NULL`
//! - Match family (`<kind>_<token>`, hash kinds included):
//!   `id, value TEXT UNIQUE, kind TEXT, created INTEGER, persisted INTEGER`
//! - Counters (`access`): `id, key VARCHAR(255) UNIQUE, value INTEGER`
//!
//! Uniqueness of `value` is enforced here, not by the buffer: every insert
//! is `ON CONFLICT(value) DO NOTHING`, so duplicates within a batch or across
//! flush cycles collapse to one row.

use super::error::{ConnectionError, StoreError};
use super::indicator::{Indicator, IndicatorKind};
use super::routing::{TableFamily, TableId};
use super::supervisor::ConnectionSupervisor;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Longest counter key the `access` table stores
pub const MAX_COUNTER_KEY_LEN: usize = 255;

const COUNTER_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS access (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    key   VARCHAR(255) NOT NULL UNIQUE,
    value INTEGER NOT NULL
)";

/// A free-text pattern match routed to a `<kind>_<token>` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub id: Option<i64>,
    pub kind: String,
    pub value: String,
    pub created: i64,
    pub persisted: bool,
}

impl MatchRecord {
    pub fn new(kind: impl Into<String>, value: impl Into<String>, created: i64) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            value: value.into(),
            created,
            persisted: false,
        }
    }
}

/// A row found by a point lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum Record {
    Address(Indicator),
    Match(MatchRecord),
}

/// Storage seam used by the scheduler, stats and match registry
#[async_trait]
pub trait IndicatorStore: Send + Sync {
    /// Lightweight health probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Re-establish the handle after a failed probe
    async fn reconnect(&self) -> Result<(), ConnectionError>;

    /// Idempotently provision a shard table
    async fn ensure_table(&self, table: &TableId) -> Result<(), StoreError>;

    /// Conflict-ignoring insert of one batch in a single statement.
    ///
    /// Empty values and values wider than the table's column are dropped
    /// before the statement is built. Returns rows actually written.
    async fn bulk_insert(&self, table: &TableId, values: Vec<String>) -> Result<usize, StoreError>;

    /// Point lookup; a missing table or row is `Ok(None)`
    async fn lookup(&self, table: &TableId, value: &str) -> Result<Option<Record>, StoreError>;

    /// Insert one match record; `Ok(false)` when the value was already stored
    async fn record_match(&self, table: &TableId, record: &MatchRecord) -> Result<bool, StoreError>;

    /// Every stored indicator of `kind` across the given tables
    async fn load_indicators(
        &self,
        kind: IndicatorKind,
        tables: &[TableId],
    ) -> Result<Vec<Indicator>, StoreError>;

    /// Upsert counters keyed by name; returns rows written
    async fn save_counters(&self, counters: &BTreeMap<String, i64>) -> Result<usize, StoreError>;

    async fn load_counters(&self) -> Result<BTreeMap<String, i64>, StoreError>;
}

/// Truncate a counter key on a char boundary
pub fn truncate_key(key: &str) -> &str {
    if key.len() <= MAX_COUNTER_KEY_LEN {
        return key;
    }
    let mut end = MAX_COUNTER_KEY_LEN;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists([name])?)
}

fn create_table_sql(table: &TableId) -> String {
    match table.family() {
        TableFamily::Address => format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                value VARCHAR({}) UNIQUE NOT NULL
            )",
            table.quoted(),
            table.width().unwrap_or(15)
        ),
        TableFamily::Match => format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                value     TEXT NOT NULL UNIQUE,
                kind      TEXT NOT NULL,
                created   INTEGER NOT NULL,
                persisted INTEGER NOT NULL DEFAULT 0
            )",
            table.quoted()
        ),
    }
}

/// Build the multi-row insert for one batch; values are bound, never inlined
fn bulk_insert_sql(table: &TableId, values: &[String], created: i64) -> (String, Vec<Value>) {
    let n = values.len();
    let mut args: Vec<Value> = values.iter().cloned().map(Value::Text).collect();

    let (columns, rows) = match table.family() {
        TableFamily::Address => {
            let rows: Vec<String> = (1..=n).map(|i| format!("(?{})", i)).collect();
            ("value", rows)
        }
        TableFamily::Match => {
            let kind_param = n + 1;
            let created_param = n + 2;
            args.push(Value::Text(table.kind().to_string()));
            args.push(Value::Integer(created));
            let rows: Vec<String> = (1..=n)
                .map(|i| format!("(?{}, ?{}, ?{}, 1)", i, kind_param, created_param))
                .collect();
            ("value, kind, created, persisted", rows)
        }
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT(value) DO NOTHING",
        table.quoted(),
        columns,
        rows.join(", ")
    );
    (sql, args)
}

/// SQLite-backed `IndicatorStore`
pub struct SqliteShardStore {
    supervisor: Arc<ConnectionSupervisor>,
    /// (supervisor generation, tables known to exist on that handle)
    provisioned: Mutex<(u64, HashSet<String>)>,
}

impl SqliteShardStore {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            provisioned: Mutex::new((0, HashSet::new())),
        }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    fn is_provisioned(&self, name: &str) -> bool {
        let generation = self.supervisor.generation();
        let mut guard = self.provisioned.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.0 != generation {
            *guard = (generation, HashSet::new());
        }
        guard.1.contains(name)
    }

    fn mark_provisioned(&self, name: &str) {
        let generation = self.supervisor.generation();
        let mut guard = self.provisioned.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.0 != generation {
            *guard = (generation, HashSet::new());
        }
        guard.1.insert(name.to_string());
    }

    fn provision(&self, conn: &Connection, table: &TableId) -> Result<(), StoreError> {
        if self.is_provisioned(table.name()) {
            return Ok(());
        }
        conn.execute_batch(&create_table_sql(table))?;
        self.mark_provisioned(table.name());
        log::debug!("🔧 Provisioned table {}", table);
        Ok(())
    }

    fn require_match_family(table: &TableId) -> Result<(), StoreError> {
        if table.family() != TableFamily::Match {
            return Err(StoreError::FamilyMismatch {
                table: table.name().to_string(),
                expected: "match",
            });
        }
        Ok(())
    }
}

#[async_trait]
impl IndicatorStore for SqliteShardStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.supervisor.health_check()
    }

    async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.supervisor.reconnect().await
    }

    async fn ensure_table(&self, table: &TableId) -> Result<(), StoreError> {
        self.supervisor.with_conn(|conn| self.provision(conn, table))
    }

    async fn bulk_insert(&self, table: &TableId, values: Vec<String>) -> Result<usize, StoreError> {
        let width = table.width();
        let values: Vec<String> = values
            .into_iter()
            .filter(|v| !v.is_empty() && width.map_or(true, |w| v.len() <= w))
            .collect();

        if values.is_empty() {
            return Ok(0);
        }

        let created = chrono::Utc::now().timestamp();
        let (sql, args) = bulk_insert_sql(table, &values, created);

        self.supervisor.with_conn(|conn| {
            self.provision(conn, table)?;
            let written = conn.execute(&sql, params_from_iter(args))?;
            log::debug!(
                "✅ {}: {} of {} values newly written",
                table,
                written,
                values.len()
            );
            Ok(written)
        })
    }

    async fn lookup(&self, table: &TableId, value: &str) -> Result<Option<Record>, StoreError> {
        self.supervisor.with_conn(|conn| {
            if !table_exists(conn, table.name())? {
                return Ok(None);
            }
            match table.family() {
                TableFamily::Address => {
                    let sql = format!("SELECT id, value FROM {} WHERE value = ?1", table.quoted());
                    let found = conn
                        .query_row(&sql, [value], |row| {
                            Ok(Indicator::stored(IndicatorKind::Ip4, row.get(0)?, row.get(1)?))
                        })
                        .optional()?;
                    Ok(found.map(Record::Address))
                }
                TableFamily::Match => {
                    let sql = format!(
                        "SELECT id, value, kind, created, persisted FROM {} WHERE value = ?1",
                        table.quoted()
                    );
                    let found = conn
                        .query_row(&sql, [value], |row| {
                            Ok(MatchRecord {
                                id: Some(row.get(0)?),
                                value: row.get(1)?,
                                kind: row.get(2)?,
                                created: row.get(3)?,
                                persisted: row.get(4)?,
                            })
                        })
                        .optional()?;
                    Ok(found.map(Record::Match))
                }
            }
        })
    }

    async fn record_match(&self, table: &TableId, record: &MatchRecord) -> Result<bool, StoreError> {
        Self::require_match_family(table)?;
        if record.value.is_empty() || table.width().is_some_and(|w| record.value.len() > w) {
            return Ok(false);
        }

        self.supervisor.with_conn(|conn| {
            self.provision(conn, table)?;
            let sql = format!(
                "INSERT INTO {} (value, kind, created, persisted) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(value) DO NOTHING",
                table.quoted()
            );
            let written = conn.execute(&sql, params![record.value, record.kind, record.created])?;
            Ok(written == 1)
        })
    }

    async fn load_indicators(
        &self,
        kind: IndicatorKind,
        tables: &[TableId],
    ) -> Result<Vec<Indicator>, StoreError> {
        self.supervisor.with_conn(|conn| {
            let mut loaded = Vec::new();
            for table in tables {
                if !table_exists(conn, table.name())? {
                    continue;
                }
                let sql = format!("SELECT id, value FROM {} ORDER BY id", table.quoted());
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], |row| {
                    Ok(Indicator::stored(kind, row.get(0)?, row.get(1)?))
                })?;
                for row in rows {
                    loaded.push(row?);
                }
            }
            Ok(loaded)
        })
    }

    async fn save_counters(&self, counters: &BTreeMap<String, i64>) -> Result<usize, StoreError> {
        // Truncation can fold two keys onto one; the later key wins.
        let rows: BTreeMap<&str, i64> = counters
            .iter()
            .map(|(key, value)| (truncate_key(key), *value))
            .collect();

        self.supervisor.with_conn(|conn| {
            conn.execute_batch(COUNTER_TABLE_DDL)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO access (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )?;
                for (key, value) in &rows {
                    stmt.execute(params![key, value])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
    }

    async fn load_counters(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.supervisor.with_conn(|conn| {
            conn.execute_batch(COUNTER_TABLE_DDL)?;
            let mut stmt = conn.prepare("SELECT key, value FROM access")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut counters = BTreeMap::new();
            for row in rows {
                let (key, value) = row?;
                counters.insert(key, value);
            }
            Ok(counters)
        })
    }
}
