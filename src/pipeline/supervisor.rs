//! Connection supervision for the single store handle
//!
//! The supervisor owns the only `rusqlite::Connection`. Queries borrow it
//! through `with_conn`; a reconnect takes the handle out first, so a query
//! that races a reconnect sees `StoreError::Disconnected` instead of a
//! half-replaced handle.

use super::error::{ConnectionError, StoreError};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

/// Fixed-delay retry policy for establishing the store handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

/// Apply the connection PRAGMAs (WAL, NORMAL sync, busy timeout)
fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("journal_mode={}", mode);
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn open_connection(dsn: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(dsn)?;
    apply_pragmas(&conn)?;
    conn.query_row("SELECT 1", [], |_| Ok(()))?;
    Ok(conn)
}

async fn establish(dsn: &str, policy: RetryPolicy) -> Result<Connection, ConnectionError> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts() {
        match open_connection(dsn) {
            Ok(conn) => {
                if attempt > 1 {
                    log::info!("✅ Connected to {} on attempt {}", dsn, attempt);
                }
                return Ok(conn);
            }
            Err(e) => {
                log::warn!(
                    "⏳ Connect attempt {} of {} to {} failed: {}",
                    attempt,
                    policy.max_attempts(),
                    dsn,
                    e
                );
                last_error = e.to_string();
                if attempt < policy.max_attempts() {
                    sleep(policy.delay()).await;
                }
            }
        }
    }

    Err(ConnectionError::RetriesExhausted {
        dsn: dsn.to_string(),
        attempts: policy.max_attempts(),
        last_error,
    })
}

pub struct ConnectionSupervisor {
    dsn: String,
    policy: RetryPolicy,
    handle: Mutex<Option<Connection>>,
    generation: AtomicU64,
}

impl ConnectionSupervisor {
    /// Establish the handle, retrying per `policy`.
    ///
    /// Exhausting the retries here is meant to be fatal for the caller.
    pub async fn connect(dsn: &str, policy: RetryPolicy) -> Result<Self, ConnectionError> {
        let conn = establish(dsn, policy).await?;
        log::info!("✅ Store handle established: {}", dsn);
        Ok(Self {
            dsn: dsn.to_string(),
            policy,
            handle: Mutex::new(Some(conn)),
            generation: AtomicU64::new(1),
        })
    }

    /// Replace the handle after a failed health probe.
    ///
    /// On failure the supervisor stays disconnected; storage calls fail with
    /// `StoreError::Disconnected` until a later reconnect succeeds.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let stale = self.lock().take();
        drop(stale);

        log::warn!("🔄 Reconnecting to {}", self.dsn);
        let conn = establish(&self.dsn, self.policy).await?;

        *self.lock() = Some(conn);
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::info!("✅ Reconnected to {}", self.dsn);
        Ok(())
    }

    /// Lightweight probe: `SELECT 1`
    pub fn health_check(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Run `f` against the live handle
    pub fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Disconnected),
        }
    }

    /// Drop the handle
    pub fn disconnect(&self) {
        if self.lock().take().is_some() {
            log::info!("🔌 Store handle closed: {}", self.dsn);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    /// Bumped on every successful reconnect
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_connect_and_probe() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let supervisor = ConnectionSupervisor::connect(db_path.to_str().unwrap(), quick_policy(1))
            .await
            .unwrap();

        assert!(supervisor.health_check().is_ok());
        assert_eq!(supervisor.generation(), 1);

        let mode: String = supervisor
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("missing").join("nested").join("store.db");
        let result =
            ConnectionSupervisor::connect(db_path.to_str().unwrap(), quick_policy(3)).await;

        match result {
            Err(ConnectionError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            Ok(_) => panic!("connect should fail for a missing directory"),
        }
    }

    #[tokio::test]
    async fn test_disconnected_queries_fail_cleanly() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let supervisor = ConnectionSupervisor::connect(db_path.to_str().unwrap(), quick_policy(1))
            .await
            .unwrap();

        supervisor.disconnect();
        assert!(!supervisor.is_connected());
        assert!(matches!(
            supervisor.health_check(),
            Err(StoreError::Disconnected)
        ));

        supervisor.reconnect().await.unwrap();
        assert!(supervisor.health_check().is_ok());
        assert_eq!(supervisor.generation(), 2);
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(5));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(RetryPolicy::default().max_attempts(), 5);
    }
}
