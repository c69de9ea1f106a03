//! Pipeline configuration from environment variables

use super::scheduler::MAX_BATCH_SIZE;
use super::supervisor::RetryPolicy;
use std::env;
use std::time::Duration;

pub const DEFAULT_MATCH_KINDS: [&str; 6] = ["md5", "sha1", "sha256", "sha512", "url", "email"];

/// Configuration for the ingestion pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Flush tick interval in seconds
    pub flush_interval_secs: u64,

    /// Values per insert statement (1..=500)
    pub flush_batch_size: usize,

    /// Connection attempts before giving up
    pub connect_retries: u32,

    /// Delay between connection attempts in milliseconds
    pub connect_retry_delay_ms: u64,

    /// Free-text pattern kinds with their own match tables
    pub match_kinds: Vec<String>,

    /// Read `kind value` lines from stdin
    pub stdin_feed: bool,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .map(str::to_string)
        .collect()
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SHARDFLOW_DB_PATH` (default: shardflow.db)
    /// - `FLUSH_INTERVAL_SECS` (default: 20)
    /// - `FLUSH_BATCH_SIZE` (default: 500, clamped to 1..=500)
    /// - `CONNECT_RETRIES` (default: 5)
    /// - `CONNECT_RETRY_DELAY_MS` (default: 2000)
    /// - `MATCH_KINDS` (default: md5,sha1,sha256,sha512,url,email)
    /// - `STDIN_FEED` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env::var("SHARDFLOW_DB_PATH").unwrap_or(defaults.db_path),

            flush_interval_secs: parse_var("FLUSH_INTERVAL_SECS", defaults.flush_interval_secs).max(1),

            flush_batch_size: parse_var("FLUSH_BATCH_SIZE", defaults.flush_batch_size)
                .clamp(1, MAX_BATCH_SIZE),

            connect_retries: parse_var("CONNECT_RETRIES", defaults.connect_retries),

            connect_retry_delay_ms: parse_var("CONNECT_RETRY_DELAY_MS", defaults.connect_retry_delay_ms),

            match_kinds: env::var("MATCH_KINDS")
                .ok()
                .map(|raw| parse_list(&raw))
                .filter(|kinds| !kinds.is_empty())
                .unwrap_or(defaults.match_kinds),

            stdin_feed: parse_var("STDIN_FEED", defaults.stdin_feed),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_retries,
            Duration::from_millis(self.connect_retry_delay_ms),
        )
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "shardflow.db".to_string(),
            flush_interval_secs: 20,
            flush_batch_size: MAX_BATCH_SIZE,
            connect_retries: 5,
            connect_retry_delay_ms: 2_000,
            match_kinds: DEFAULT_MATCH_KINDS.iter().map(|k| k.to_string()).collect(),
            stdin_feed: true,
        }
    }
}
