//! Error and Result types for collator operations.

use crate::collator::Phase;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for collator operations.
pub type Result<T> = std::result::Result<T, CollateError>;

/// The error type for collator operations.
#[derive(Debug, Error)]
pub enum CollateError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid collator configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An operation was invoked in the wrong lifecycle phase.
    #[error("`{op}` invoked in the {phase:?} phase")]
    InvalidPhase {
        /// The rejected operation.
        op: &'static str,
        /// The phase the collator was in.
        phase: Phase,
    },

    /// Statistics were requested but not gathered during collation.
    #[error("Statistics were not gathered; enable `compute_stats` before collating")]
    StatsUnavailable,

    /// A partition file did not contain a whole number of records.
    #[error("Partition file truncated: {0} trailing bytes")]
    TruncatedRecord(usize),

    /// A background worker thread panicked.
    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}
