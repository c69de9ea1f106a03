//! Shardflow Runtime
//!
//! Connects to the indicator store, seeds the known-address cache, runs the
//! flush scheduler and (optionally) reads requests from stdin:
//!
//! ```text
//! ip4 8.8.8.8          buffer an indicator (ip4, md5, sha1, sha256, sha512)
//! url https://x.test   find-or-record a free-text match kind
//! check 8.8.8.8        known-address query
//! scan <text>          run the built-in patterns over <text>
//! stats | counts | last   print JSON snapshots
//! quit                 stop the runtime
//! ```
//!
//! Usage:
//!   cargo run --release --bin shardflow_runtime
//!
//! Environment variables:
//!   SHARDFLOW_DB_PATH - SQLite database path (default: shardflow.db)
//!   FLUSH_INTERVAL_SECS - Flush interval (default: 20)
//!   FLUSH_BATCH_SIZE - Values per insert statement (default: 500)
//!   CONNECT_RETRIES / CONNECT_RETRY_DELAY_MS - Connection retry policy
//!   MATCH_KINDS - Free-text match kinds (default: md5,sha1,sha256,sha512,url,email)
//!   STDIN_FEED - Read requests from stdin (default: true)

use dotenv::dotenv;
use log::{error, info, warn};
use shardflow::pipeline::{
    shutdown_signal, IndicatorKind, MatchLookup, Pipeline, PipelineConfig, RegexMatcher,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Shardflow Runtime");

    let config = PipelineConfig::from_env();
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Flush interval: {}s", config.flush_interval_secs);
    info!("   ├─ Batch size: {}", config.flush_batch_size);
    info!("   ├─ Match kinds: {}", config.match_kinds.join(","));
    info!("   └─ Stdin feed: {}", config.stdin_feed);

    // Exhausting retries here is fatal
    let pipeline = Arc::new(Pipeline::connect(&config).await?);

    if let Err(e) = pipeline.load_known().await {
        warn!("⚠️  Could not seed known cache: {}", e);
    }
    match pipeline.durable_counters().await {
        Ok(counters) => info!("📊 {} durable counters on record", counters.len()),
        Err(e) => warn!("⚠️  Could not read durable counters: {}", e),
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = pipeline.scheduler(&config);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_signal(stop_rx)));
    info!("✅ Flush scheduler spawned");

    let feed_task = if config.stdin_feed {
        let pipeline = pipeline.clone();
        let matcher = RegexMatcher::with_defaults()?;
        Some(tokio::spawn(async move {
            run_stdin_feed(pipeline, matcher, stop_tx).await;
        }))
    } else {
        None
    };

    info!("🔄 Press CTRL+C to shutdown");

    if let Err(e) = scheduler_task.await {
        error!("❌ Flush scheduler task failed: {}", e);
    }
    if let Some(feed) = feed_task {
        feed.abort();
    }

    let buffered: usize = pipeline.buffered_counts().values().sum();
    if buffered > 0 {
        warn!("⚠️  Exiting with {} unflushed values", buffered);
    }
    info!("✅ Shardflow runtime stopped");
    Ok(())
}

async fn run_stdin_feed(pipeline: Arc<Pipeline>, matcher: RegexMatcher, stop_tx: watch::Sender<bool>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("📭 Stdin closed; scheduler keeps running");
                return;
            }
            Err(e) => {
                error!("❌ Failed to read stdin: {}", e);
                return;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            if let Err(e) = stop_tx.send(true) {
                error!("❌ Failed to signal stop: {}", e);
            }
            return;
        }

        match handle_line(&pipeline, &matcher, line).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {}", e),
        }
    }
}

async fn handle_line(
    pipeline: &Pipeline,
    matcher: &RegexMatcher,
    line: &str,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let output = match command {
        "stats" => serde_json::to_string(&pipeline.stats_snapshot().await)?,
        "counts" => serde_json::to_string(&pipeline.buffered_counts())?,
        "last" => serde_json::to_string(&pipeline.last_flush().await)?,
        "check" => serde_json::to_string(&pipeline.check_ip4(rest).await?)?,
        "scan" => serde_json::to_string(&pipeline.scan_text(rest, matcher).await)?,
        kind if IndicatorKind::parse(kind).is_ok() => {
            let admission = pipeline.ingest(kind, rest).await?;
            format!("{:?}", admission)
        }
        kind => match pipeline.find_or_record(kind, rest).await? {
            MatchLookup::Seen(record) => format!("seen {}", serde_json::to_string(&record)?),
            MatchLookup::NotSeen { .. } => "new".to_string(),
        },
    };
    Ok(output)
}
