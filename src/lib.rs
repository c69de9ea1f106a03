//! shardflow: sharded indicator ingestion with periodic batched flush to SQLite

pub mod pipeline;

pub use pipeline::{Pipeline, PipelineConfig};
