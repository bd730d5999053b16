//! Error taxonomy for the sibling analysis pipeline
//!
//! Row-level and pair-level problems are recovered locally (skip-and-count)
//! and never surface as `Err`. The variants below are what reaches callers:
//! a file that cannot be ingested, an index that cannot be built or loaded,
//! or a configuration that fails validation.

use thiserror::Error;

/// Errors that can occur while ingesting, indexing or aggregating traces
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required column is absent from an input file. Aborts that file only.
    #[error("Missing required column '{column}' in {source_name}")]
    MissingColumn { source_name: String, column: String },

    /// An rpc path could not be turned into a parent context.
    #[error("Invalid rpc path at row {row}: {reason}")]
    InvalidKey { row: usize, reason: String },

    /// A pair or lookup had no matching data.
    #[error("No data: {0}")]
    NoData(String),

    /// The metric source behind a time-bucket index is unusable.
    #[error("Failed to build index: {0}")]
    IndexBuild(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to encode index: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode index: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Index format mismatch: expected {expected}, found {found}")]
    FormatMismatch { expected: String, found: String },

    /// A batch worker thread panicked.
    #[error("Worker failure: {0}")]
    Worker(String),

    #[error("Failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for errors that abort a single file or batch but not the run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingColumn { .. }
                | PipelineError::InvalidKey { .. }
                | PipelineError::NoData(_)
        )
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
