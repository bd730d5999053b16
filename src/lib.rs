//! sibscope - Sibling-call concurrency analysis for microservice traces
//!
//! Given distributed-trace call-graph rows, this library finds pairs of
//! services called by the same parent within a trace, replays their timing
//! to classify each co-occurrence as sequential or concurrent, and
//! optionally attaches system-load and call-rate context looked up through a
//! time-bucketed index.

pub mod aggregator;
pub mod bucket_index;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod context;
pub mod csv_output;
pub mod dependencies;
pub mod error;
pub mod ingest;
pub mod json_output;
pub mod pipeline;
pub mod record;
pub mod sibling;
